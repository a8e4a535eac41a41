//! remote operations: http endpoints and local-path remotes

pub mod download;
pub mod jobs;
pub mod local;
pub mod progress;
pub mod pull;
pub mod push;
pub mod remote;
pub mod upload;

pub use download::{download_objects, DownloadSummary};
pub use jobs::{run_jobs, Job, DOWNLOAD_WORKERS, UPLOAD_WORKERS};
pub use local::{copy_objects, fetch_local, push_local, TransferStats};
pub use progress::{
    JobProgress, Progress, ProgressEvent, ProgressReader, ProgressRenderer, RecordingRenderer,
    TracingRenderer,
};
pub use pull::{clone, fetch, get, FetchResult, GetOptions};
pub use push::{post, post_body, PostOptions, PostResult};
pub use remote::{LocalRemote, ObjectMeta, Remote, RemoteInfo, Target, OBJECT_TYPE_HEADER};
pub use upload::{upload_objects, UploadOutcome, UploadSummary};
