pub mod decoder;
pub mod frame;

pub use decoder::decode_frame;
pub use frame::{Frame, Stream, StreamFormat};
pub use frame::{DEPTH_BYTES, FRAME_HEIGHT, FRAME_WIDTH, RGB_BYTES};
