pub mod definition;
pub mod repository;

pub use definition::{BookInfoRules, ContentRules, HeaderSpec, ReplaceRule, SourceDefinition, TocRules};
pub use repository::{
    DirectorySourceRepository, DirectorySourceRepositoryBuilder, MemorySourceRepository, SourceRepository,
};
