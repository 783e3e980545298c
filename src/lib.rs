pub mod acquisition;
pub mod codec;
pub mod compressor;
pub mod device;
pub mod digest;
pub mod ewf;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod processor;
pub mod reader;
pub mod report;
pub mod verify;
pub mod writer;

pub use acquisition::{acquire, Acquisition};
pub use codec::{CodecError, CompressionLevel};
pub use device::{Device, RawDevice};
pub use options::{AcquisitionOptions, CaseMetadata};
pub use pipeline::{ImagingError, StopHandle};
pub use report::{AcquisitionReport, ReportStatus};
pub use verify::{verify_image, VerifyReport};
