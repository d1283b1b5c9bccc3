pub mod api_client;
pub mod diff_patcher;
pub mod disk_space;
pub mod integrity;
pub mod license_service;
pub mod local_state;
pub mod rdiff;
pub mod remote_meta;
pub mod resource_acquirer;
pub mod transports;
pub mod unarchiver;

pub use api_client::{ApiClient, HttpRemoteMetaData};
pub use diff_patcher::{AtomicDiffPatcher, DiffPatcher};
pub use integrity::{HashVerification, IntegrityChecker};
pub use license_service::{LicensePrompt, LicenseValidator};
pub use local_state::LocalInstallState;
pub use remote_meta::RemoteMetaData;
pub use resource_acquirer::{ResourceAcquirer, Transports};
