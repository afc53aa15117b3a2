use crate::error::{QuireError, Result};
use crate::source::definition::SourceDefinition;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Supplies source definitions by id. Read-only to the engine.
pub trait SourceRepository: Send + Sync {
    /// Returns the definition for `id`, or [`QuireError::UnknownSource`].
    fn get_source(&self, id: &str) -> Result<Arc<SourceDefinition>>;
}

/// Source repository backed by a map, for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemorySourceRepository {
    sources: HashMap<String, Arc<SourceDefinition>>,
}

impl MemorySourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: SourceDefinition) {
        self.sources.insert(source.id.clone(), Arc::new(source));
    }

    pub fn with_source(mut self, source: SourceDefinition) -> Self {
        self.insert(source);
        self
    }
}

impl SourceRepository for MemorySourceRepository {
    fn get_source(&self, id: &str) -> Result<Arc<SourceDefinition>> {
        self.sources.get(id).cloned().ok_or_else(|| QuireError::UnknownSource(id.to_string()))
    }
}

/// Loads `<id>.json` source definitions from a custom and a standard
/// directory. Custom definitions shadow standard ones.
#[derive(Debug)]
pub struct DirectorySourceRepository {
    /// Custom source directory path
    custom_dir: Option<PathBuf>,
    /// Standard source directory path
    standard_dir: Option<PathBuf>,
    /// Parsed definition cache
    cache: RwLock<HashMap<String, Arc<SourceDefinition>>>,
}

impl DirectorySourceRepository {
    /// Create a repository with no directories
    pub fn new() -> Self {
        Self { custom_dir: None, standard_dir: None, cache: RwLock::new(HashMap::new()) }
    }

    /// Create a repository reading a single directory
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        DirectorySourceRepositoryBuilder::new().custom_dir(dir).build()
    }

    /// Load a definition by id, consulting the cache first
    pub fn load(&self, id: &str) -> Result<Arc<SourceDefinition>> {
        if let Ok(cache) = self.cache.read()
            && let Some(source) = cache.get(id)
        {
            return Ok(Arc::clone(source));
        }

        let path = self.find_source_file(id).ok_or_else(|| QuireError::UnknownSource(id.to_string()))?;
        let source = Arc::new(Self::parse_file(&path)?);

        if source.id != id {
            return Err(QuireError::ConfigError(format!(
                "source file {} declares id '{}' but was requested as '{}'",
                path.display(),
                source.id,
                id
            )));
        }

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(id.to_string(), Arc::clone(&source));
        }

        Ok(source)
    }

    /// List every source id available, custom first, without duplicates
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();

        for dir in [&self.custom_dir, &self.standard_dir].into_iter().flatten() {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            let mut found: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().to_string()))
                .collect();
            found.sort();

            for id in found {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        ids
    }

    /// Clear the definition cache
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn find_source_file(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return None;
        }

        let file_name = format!("{}.json", id);
        [&self.custom_dir, &self.standard_dir]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.exists())
    }

    fn parse_file(path: &Path) -> Result<SourceDefinition> {
        let text = fs::read_to_string(path)
            .map_err(|e| QuireError::ConfigError(format!("Cannot open file {}: {}", path.display(), e)))?;
        SourceDefinition::from_json(&text)
            .map_err(|e| QuireError::ConfigError(format!("{} ({})", e, path.display())))
    }
}

impl SourceRepository for DirectorySourceRepository {
    fn get_source(&self, id: &str) -> Result<Arc<SourceDefinition>> {
        self.load(id)
    }
}

/// Builder for DirectorySourceRepository
#[derive(Debug)]
pub struct DirectorySourceRepositoryBuilder {
    custom_dir: Option<PathBuf>,
    standard_dir: Option<PathBuf>,
}

impl DirectorySourceRepositoryBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self { custom_dir: None, standard_dir: None }
    }

    /// Set custom source directory
    pub fn custom_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set standard source directory
    pub fn standard_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.standard_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the DirectorySourceRepository
    pub fn build(self) -> DirectorySourceRepository {
        DirectorySourceRepository {
            custom_dir: self.custom_dir,
            standard_dir: self.standard_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for DirectorySourceRepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for DirectorySourceRepository {
    fn default() -> Self {
        let mut builder = DirectorySourceRepositoryBuilder::new();

        if let Some(custom_dir) = Self::default_custom_dir() {
            builder = builder.custom_dir(custom_dir);
        }

        if let Some(standard_dir) = Self::default_standard_dir() {
            builder = builder.standard_dir(standard_dir);
        }

        builder.build()
    }
}

impl DirectorySourceRepository {
    /// Get default custom source directory (~/.config/quire/sources)
    pub fn default_custom_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("quire").join("sources"))
    }

    /// Get default standard source directory (`sources` next to the working directory)
    fn default_standard_dir() -> Option<PathBuf> {
        let std_dir = PathBuf::from("sources");
        if std_dir.exists() { Some(std_dir) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &Path, id: &str, name: &str) {
        fs::write(
            dir.join(format!("{}.json", id)),
            format!(r#"{{"id": "{}", "name": "{}", "bookInfo": {{"name": "h1"}}}}"#, id, name),
        )
        .unwrap();
    }

    #[test]
    fn test_load_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        write_source(temp_dir.path(), "demo", "Demo");

        let repo = DirectorySourceRepository::from_dir(temp_dir.path());
        let source = repo.get_source("demo").unwrap();

        assert_eq!(source.name, "Demo");
        assert!(source.book_info.name.is_some());
    }

    #[test]
    fn test_unknown_source() {
        let temp_dir = TempDir::new().unwrap();
        let repo = DirectorySourceRepository::from_dir(temp_dir.path());

        assert!(matches!(repo.get_source("missing"), Err(QuireError::UnknownSource(_))));
        assert!(matches!(repo.get_source("../etc"), Err(QuireError::UnknownSource(_))));
    }

    #[test]
    fn test_custom_shadows_standard() {
        let temp_dir = TempDir::new().unwrap();
        let custom_path = temp_dir.path().join("custom");
        let standard_path = temp_dir.path().join("standard");
        fs::create_dir_all(&custom_path).unwrap();
        fs::create_dir_all(&standard_path).unwrap();

        write_source(&custom_path, "demo", "Custom");
        write_source(&standard_path, "demo", "Standard");
        write_source(&standard_path, "other", "Other");

        let repo = DirectorySourceRepositoryBuilder::new()
            .custom_dir(&custom_path)
            .standard_dir(&standard_path)
            .build();

        assert_eq!(repo.get_source("demo").unwrap().name, "Custom");
        assert_eq!(repo.get_source("other").unwrap().name, "Other");
        assert_eq!(repo.list_ids(), vec!["demo".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_caching() {
        let temp_dir = TempDir::new().unwrap();
        write_source(temp_dir.path(), "demo", "First");

        let repo = DirectorySourceRepository::from_dir(temp_dir.path());
        let first = repo.get_source("demo").unwrap();

        write_source(temp_dir.path(), "demo", "Second");
        let cached = repo.get_source("demo").unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        repo.clear_cache();
        assert_eq!(repo.get_source("demo").unwrap().name, "Second");
    }

    #[test]
    fn test_id_mismatch_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("demo.json"), r#"{"id": "other"}"#).unwrap();

        let repo = DirectorySourceRepository::from_dir(temp_dir.path());
        assert!(matches!(repo.get_source("demo"), Err(QuireError::ConfigError(_))));
    }

    #[test]
    fn test_memory_repository() {
        let source = SourceDefinition::from_json(r#"{"id": "m"}"#).unwrap();
        let repo = MemorySourceRepository::new().with_source(source);
        assert!(repo.get_source("m").is_ok());
        assert!(matches!(repo.get_source("x"), Err(QuireError::UnknownSource(_))));
    }
}
