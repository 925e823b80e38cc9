//! Loop detection and the stop-file protocol

mod loop_detector;
mod stop_file;

pub use loop_detector::{
    DEFAULT_IDENTICAL_THRESHOLD, DEFAULT_MIN_RESPONSE_LENGTH, DetectorConfig, LoopDetector, LoopReason, Verdict,
};
pub use stop_file::{StopRequest, generate_nonce, read_stop_file, stop_file_instruction, stop_file_name, stop_file_path};
