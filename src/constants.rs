// Centralized constants for imageforge to avoid magic strings and numbers

/// Prefix of the tag under which a cache key is stored in the work repository
pub const CACHE_TAG_PREFIX: &str = "z-";

/// Dockerfile used when a spec does not name one
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Ignore file read from a spec's directory when walking directory sources
pub const IGNORE_FILE: &str = ".dockerignore";

/// Repository of the tag a build carries until its context is verified
pub const STAGING_REPOSITORY: &str = "imageforge-staging";

/// Mount point of the artifacts root inside the extraction container
pub const ARTIFACTS_MOUNT: &str = "/forge-artifacts";

/// Modification time written into every context tar header
pub const NORMALIZED_MTIME: u64 = 0;

/// Permission bits kept for context entries
pub const MODE_MASK: u32 = 0o777;

/// Shown in place of a full digest in log lines
pub const SHORT_DIGEST_LEN: usize = 12;

/// Variables forwarded to every runtime subprocess
pub const BASE_ENV_ALLOWLIST: &[&str] = &["HOME", "USER", "PATH"];

pub const DOCKER_ENV_ALLOWLIST: &[&str] = &[
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "DOCKER_CERT_PATH",
    "DOCKER_TLS_VERIFY",
    "DOCKER_CONTEXT",
];

pub const PODMAN_ENV_ALLOWLIST: &[&str] = &[
    "CONTAINER_HOST",
    "CONTAINER_CONNECTION",
    "CONTAINERS_CONF",
    "CONTAINERS_REGISTRIES_CONF",
    "REGISTRY_AUTH_FILE",
    "XDG_RUNTIME_DIR",
];

/// Chunk size used when streaming the build context into the builder
pub const CONTEXT_CHUNK_SIZE: usize = 64 * 1024;

/// In-flight chunks between the context producer and the subprocess
pub const CONTEXT_CHANNEL_DEPTH: usize = 16;

/// Default maximum number of attempts for registry requests
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff for requests in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff limit in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Timeout for a single registry HTTP request in seconds
pub const REGISTRY_TIMEOUT_SECS: u64 = 30;

/// Manifest media types accepted from registries
pub const MANIFEST_ACCEPT: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];
