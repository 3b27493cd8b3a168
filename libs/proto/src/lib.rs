//! Wire protocol between the vmherd controller and dispatcher.
//!
//! The control channel carries fixed 50-byte ASCII frames, two
//! semicolon-terminated fields (`TYPE;VALUE;`) NUL-padded to the frame
//! length. The channel is strictly request/response: every command frame
//! receives exactly one reply frame before the next command may be sent.
//!
//! ## Modules
//!
//! - `frame`: command/reply types, pure encode/decode, async frame I/O
//! - `request`: the synthetic workload payload sent to workers

pub mod frame;
pub mod request;

pub use frame::{
    read_frame, write_frame, Command, Frame, FrameError, Reply, FRAME_LEN,
};
pub use request::{encode_request, parse_response, REQUEST_LEN};
