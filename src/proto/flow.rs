use crate::frame::Reason;
use crate::proto::{WindowSize, MAX_WINDOW_SIZE};

const UNCLAIMED_NUMERATOR: i32 = 1;
const UNCLAIMED_DENOMINATOR: i32 = 2;

/// A signed flow-control credit counter, used both per stream and for the
/// connection as a whole.
///
/// `window_size` is the credit the protocol currently grants: on the send
/// side, how much we may still transmit; on the receive side, how much the
/// peer may still send us. `available` only matters on the receive side:
/// it trails `window_size` by the bytes delivered to the application but
/// not yet announced back via WINDOW_UPDATE.
///
/// A SETTINGS_INITIAL_WINDOW_SIZE decrease may legally drive a window
/// negative, hence the signed representation.
#[derive(Copy, Clone, Debug)]
pub struct FlowControl {
    window_size: i32,
    available: i32,
}

impl FlowControl {
    pub fn with_initial(size: WindowSize) -> FlowControl {
        FlowControl {
            window_size: size as i32,
            available: size as i32,
        }
    }

    pub fn window_size(&self) -> i32 {
        self.window_size
    }

    /// Send-side credit actually usable right now.
    pub fn usable(&self) -> WindowSize {
        if self.window_size < 0 {
            0
        } else {
            self.window_size as WindowSize
        }
    }

    /// Replenish credit from a WINDOW_UPDATE. Overflowing the 31-bit range
    /// is a protocol error on the sender's part, not a local bug.
    pub fn inc_window(&mut self, sz: WindowSize) -> Result<(), Reason> {
        let (val, overflow) = self.window_size.overflowing_add(sz as i32);

        if overflow || val > MAX_WINDOW_SIZE as i32 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }

        tracing::trace!("inc_window; sz={}; old={}; new={}", sz, self.window_size, val);

        self.window_size = val;
        self.available = self.available.saturating_add(sz as i32);
        Ok(())
    }

    /// Shrink the window after the peer lowers SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn dec_window(&mut self, sz: WindowSize) {
        tracing::trace!("dec_window; sz={}; window={}", sz, self.window_size);
        self.window_size -= sz as i32;
        self.available -= sz as i32;
    }

    /// Consume send credit. The caller must have reserved the capacity.
    pub fn send_data(&mut self, sz: WindowSize) {
        tracing::trace!("send_data; sz={}; window={}", sz, self.window_size);
        debug_assert!(sz as i32 <= self.window_size);
        self.window_size -= sz as i32;
        self.available -= sz as i32;
    }

    /// Account an arriving DATA frame against the receive window.
    pub fn recv_data(&mut self, sz: WindowSize) -> Result<(), Reason> {
        if (sz as i32) > self.window_size {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }

        tracing::trace!("recv_data; sz={}; window={}", sz, self.window_size);
        self.window_size -= sz as i32;
        self.available -= sz as i32;
        Ok(())
    }

    /// Record that the application consumed `sz` received bytes, making
    /// that credit eligible to be handed back to the peer.
    pub fn release(&mut self, sz: WindowSize) {
        tracing::trace!("release; sz={}; available={}", sz, self.available);
        self.available = self.available.saturating_add(sz as i32);
    }

    /// Credit worth announcing via WINDOW_UPDATE, once the consumed-but-
    /// unannounced share crosses half the current window. Claiming it
    /// moves `window_size` back up to `available`.
    pub fn unclaimed_capacity(&mut self) -> Option<WindowSize> {
        if self.window_size >= self.available {
            return None;
        }

        let unclaimed = self.available - self.window_size;
        let threshold = self.available / UNCLAIMED_DENOMINATOR * UNCLAIMED_NUMERATOR;

        if unclaimed < threshold {
            return None;
        }

        self.window_size = self.available;
        Some(unclaimed as WindowSize)
    }
}
