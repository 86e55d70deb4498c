pub mod cli;
pub mod cache;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod matcher;
pub mod scanner;
pub mod utils;

pub use cli::Cli;
pub use cache::{BuildReport, CacheEntry, CacheState, DirectoryCache, HashCache, StaleReason};
pub use config::{Config, MediaCategory};
pub use duplicates::{
    DuplicateReport, DuplicateResolver, FileRemover, FsRemover, SurvivorPolicy, print_results,
};
pub use error::{HashError, MatchError};
pub use matcher::{FallbackPolicy, MatchEngine, MatchMode, MatchReport, MatchRequest, MissingRecord};
pub use scanner::{ContentHasher, HashAlgorithm, NameSizeIndex, calculate_file_hash, index_name_size};
pub use utils::ExtensionSet;
