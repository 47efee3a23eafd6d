pub mod backend;
pub mod file;
pub mod microphone;
pub mod resample;
pub mod wav;

pub use backend::{
    downmix_to_mono, AudioBackend, AudioBackendFactory, AudioFrame, AudioSource, DeviceConstraints,
    DeviceHandle, DeviceStream, InputDevice,
};
pub use file::{AudioFile, FileBackend};
pub use microphone::MicrophoneBackend;
pub use resample::StreamResampler;
pub use wav::{encode_wav, WavHeader};
