pub mod cancel;
pub mod deleter;
pub mod downloader;
pub mod error;
pub mod events;
pub mod guard;
pub mod master;
pub mod transport;
pub mod uploader;

pub use cancel::CancelFlag;
pub use deleter::run_pending_deletions;
pub use downloader::{DownloadMode, Downloader};
pub use error::{TransferError, TransferResult};
pub use events::{Event, EventBus};
pub use guard::InFlightGuard;
pub use master::{HttpMasterRegistry, MasterRegistry};
pub use transport::{HttpTransport, NodeTransport, UploadAck, UploadPayload};
pub use uploader::Uploader;
