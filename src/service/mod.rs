/// Gate-controlled writers and isolation-level readers.
pub mod transactional;
/// Read-modify-write operations without a gate.
pub mod sample;

pub use transactional::IsolationService;
pub use sample::SampleService;
