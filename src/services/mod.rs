pub mod api_client;
pub mod availability;
pub mod download_manager;
pub mod executables;
pub mod extractor;
pub mod game_runtime_service;
pub mod group;
pub mod host_resolver;
pub mod rate_limit;
pub mod registry;
pub mod transfer;

pub use api_client::{ApiClient, LinksResult};
pub use availability::{pick_default_host, AvailabilityChecker, HostPlan};
pub use download_manager::DownloadManager;
pub use executables::{pick_executable, ExecutablePick};
pub use extractor::{ExtractJob, Extractor};
pub use game_runtime_service::GameRuntimeService;
pub use group::group_items;
pub use host_resolver::{HostResolver, ResolvedLink};
pub use rate_limit::{BandwidthThrottler, HostCooldown};
pub use registry::InstalledRegistry;
pub use transfer::{DownloadControl, TransferOutcome, TransferWorker};
