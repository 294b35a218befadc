pub mod audio;
pub mod camera;
pub mod detector;
pub mod frame;
pub mod sensors;

pub use audio::{AlertPlayer, AudioError, CommandPlayer};
pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use detector::{DetectorError, DetectorProcess, FaceDetector};
pub use frame::{Frame, FrameError};
pub use sensors::{IioSensor, MotionSensor, SensorError, SensorSubscription};
