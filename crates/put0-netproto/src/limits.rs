//! Size limits for the wire format.
//!
//! Inbound frames beyond these limits are rejected by the decoder instead of
//! being buffered without bound.

use crate::command::StompCommand;

/// Maximum encoded size of one frame (command line, headers, body, NUL).
///
/// Matches the default send buffer limit of the Spring STOMP broker.
pub const MAX_FRAME_LEN: usize = 512 * 1024;

/// Maximum number of header lines in one frame.
pub const MAX_HEADERS: usize = 64;

/// Maximum length of the command line or a single header line.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Maximum body size for frames that carry player commands and control requests.
pub const MAX_CONTROL_BODY: usize = 16 * 1024;

/// Returns the maximum body size for frames of the given command.
///
/// Server frames may carry full state snapshots; client frames only carry
/// commands and control requests.
#[inline]
pub const fn max_body_for(command: StompCommand) -> usize {
    if command.is_client_frame() {
        MAX_CONTROL_BODY
    } else {
        MAX_FRAME_LEN
    }
}
