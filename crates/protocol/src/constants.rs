use std::time::Duration;

/// Default base URL of the coordinator API.
pub const DEFAULT_API_URL: &str = "https://batch.nerdalize.com/v1";

/// Default base URL of the authentication API.
pub const DEFAULT_AUTH_URL: &str = "https://auth.nerdalize.com/v1";

/// Environment variable that may carry a bootstrap JWT.
pub const TOKEN_ENV_VAR: &str = "NERD_TOKEN";

/// Path of the token endpoint, relative to the auth API base.
pub const TOKEN_PATH: &str = "/token";

/// Token file location, relative to the user's home directory.
pub const TOKEN_FILE: &str = ".nerd/token";

/// Heartbeat period used when the coordinator does not announce one.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Object name of the per-dataset chunk index.
pub const INDEX_OBJECT: &str = "index";

/// Object name of the per-dataset metadata document.
pub const METADATA_OBJECT: &str = "metadata";

/// Path of the dataset collection of a project, relative to the API base.
pub fn datasets_path(project_id: &str) -> String {
    format!("/projects/{project_id}/datasets")
}

/// Path of a single dataset, relative to the API base.
pub fn dataset_path(project_id: &str, dataset_id: &str) -> String {
    format!("/projects/{project_id}/datasets/{dataset_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_paths() {
        assert_eq!(datasets_path("p1"), "/projects/p1/datasets");
        assert_eq!(dataset_path("p1", "d1"), "/projects/p1/datasets/d1");
    }
}
