//! Environment snapshot sanitization for specialization reloads.

use std::collections::HashMap;
use std::path::Path;

/// Key the worker directory is always published under.
pub const WORKER_DIRECTORY_KEY: &str = "FUNCTIONS_WORKER_DIRECTORY";

/// Key the function app directory is always published under.
pub const APPLICATION_DIRECTORY_KEY: &str = "FUNCTIONS_APPLICATION_DIRECTORY";

/// Sanitizes an environment snapshot for a reload request.
///
/// Entries with null or empty values are dropped; the worker directory
/// and function app directory are always present. The result is sorted
/// by key so emitted requests are deterministic. Applying this twice
/// yields the same map.
#[must_use]
pub fn sanitize_environment(
    snapshot: &HashMap<String, Option<String>>,
    worker_directory: &Path,
    function_app_directory: &Path,
) -> Vec<(String, String)> {
    let mut variables: HashMap<String, String> = snapshot
        .iter()
        .filter_map(|(key, value)| match value {
            Some(v) if !v.is_empty() => Some((key.clone(), v.clone())),
            _ => None,
        })
        .collect();

    variables.insert(
        WORKER_DIRECTORY_KEY.to_owned(),
        worker_directory.display().to_string(),
    );
    variables.insert(
        APPLICATION_DIRECTORY_KEY.to_owned(),
        function_app_directory.display().to_string(),
    );

    let mut variables: Vec<(String, String)> = variables.into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    variables
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn lookup<'a>(variables: &'a [(String, String)], key: &str) -> Option<&'a str> {
        variables
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn drops_null_and_empty_values() {
        let mut snapshot = HashMap::new();
        snapshot.insert("TestNull".to_owned(), None);
        snapshot.insert("TestEmpty".to_owned(), Some(String::new()));
        snapshot.insert("TestValid".to_owned(), Some("TestValue".to_owned()));

        let sanitized = sanitize_environment(
            &snapshot,
            &PathBuf::from("/opt/workers/node"),
            &PathBuf::from("/home/site/wwwroot"),
        );

        assert_eq!(lookup(&sanitized, "TestNull"), None);
        assert_eq!(lookup(&sanitized, "TestEmpty"), None);
        assert_eq!(lookup(&sanitized, "TestValid"), Some("TestValue"));
    }

    #[test]
    fn always_injects_directories() {
        let sanitized = sanitize_environment(
            &HashMap::new(),
            &PathBuf::from("/opt/workers/node"),
            &PathBuf::from("/home/site/wwwroot"),
        );

        assert_eq!(
            lookup(&sanitized, WORKER_DIRECTORY_KEY),
            Some("/opt/workers/node")
        );
        assert_eq!(
            lookup(&sanitized, APPLICATION_DIRECTORY_KEY),
            Some("/home/site/wwwroot")
        );
    }

    #[test]
    fn sanitization_is_idempotent() {
        let mut snapshot = HashMap::new();
        snapshot.insert("A".to_owned(), Some("1".to_owned()));
        snapshot.insert("B".to_owned(), None);

        let worker_dir = PathBuf::from("/opt/workers/node");
        let app_dir = PathBuf::from("/home/site/wwwroot");

        let once = sanitize_environment(&snapshot, &worker_dir, &app_dir);

        let as_snapshot: HashMap<String, Option<String>> = once
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        let twice = sanitize_environment(&as_snapshot, &worker_dir, &app_dir);

        assert_eq!(once, twice);
    }
}
