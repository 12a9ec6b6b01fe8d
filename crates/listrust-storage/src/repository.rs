//! Repository layer for data access

pub mod addresses;
pub mod jobs;
pub mod lists;
pub mod members;
pub mod pendings;
pub mod requests;
pub mod workflows;

// Re-export concrete repository implementations
pub use addresses::DbAddressRepository;
pub use jobs::DbJobRepository;
pub use lists::DbListRepository;
pub use members::DbMemberRepository;
pub use pendings::DbPendingRepository;
pub use requests::DbRequestRepository;
pub use workflows::DbWorkflowRepository;

// Re-export repository traits and their inputs
pub use addresses::{AddressRepository, CreateAddress};
pub use jobs::{CreateJob, JobRepository};
pub use lists::ListRepository;
pub use members::{CreateMember, MemberRepository};
pub use pendings::PendingRepository;
pub use requests::{CreateRequest, RequestRepository};
pub use workflows::WorkflowRepository;
