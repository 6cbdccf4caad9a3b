pub mod camera;
pub mod monitor;
pub mod raster;
pub mod recognizer;
#[cfg(feature = "camera-nokhwa")]
pub mod rgb_converter;

// Re-exports for convenience
pub use camera::{MediaDevices, StreamConstraints};
#[cfg(feature = "camera-nokhwa")]
pub use camera::{NokhwaDevices, available_cameras};
pub use monitor::{CaptureLoop, LoopSettings, MonitorEvent};
pub use recognizer::HttpRecognizer;
