pub mod caller_repo;
pub mod quota_repo;

pub use caller_repo::CallerRepo;
pub use quota_repo::QuotaRepo;
