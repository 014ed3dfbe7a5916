pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod state;
pub(crate) mod stream;

pub(crate) type WindowSize = u32;

pub(crate) const MAX_WINDOW_SIZE: WindowSize = (1 << 31) - 1;

/// How many recently reset streams are remembered for the post-RST_STREAM
/// grace window, and how many in-flight frames each tolerates before a
/// stray frame escalates to a connection error.
pub(crate) const DEFAULT_RESET_STREAM_MAX: usize = 10;
pub(crate) const DEFAULT_RESET_STREAM_GRACE_FRAMES: u32 = 10;
