use std::env;
#[cfg(test)]
use std::sync::Mutex;

pub const DEFAULT_JOBS_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws/execute";

/// Runbox client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the job-creation endpoint.
    pub jobs_url: String,
    /// WebSocket URL of the execution service.
    pub ws_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let jobs_url =
            env::var("RUNBOX_JOBS_URL").unwrap_or_else(|_| DEFAULT_JOBS_URL.to_string());
        let ws_url = env::var("RUNBOX_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        Self {
            jobs_url: normalize_localhost(jobs_url),
            ws_url: normalize_localhost(ws_url),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs_url: DEFAULT_JOBS_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }
}

// Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS.
fn normalize_localhost(url: String) -> String {
    if url.contains("//localhost") {
        url.replacen("//localhost", "//127.0.0.1", 1)
    } else if url.starts_with("localhost") {
        url.replacen("localhost", "127.0.0.1", 1)
    } else {
        url
    }
}

/// Languages the backend sandbox accepts.
pub const SUPPORTED_LANGUAGES: &[&str] = &["python", "javascript", "cpp", "c", "rust"];

/// Language assumed when neither a file nor `--language` is given.
pub const DEFAULT_LANGUAGE: &str = "python";

pub fn is_language_supported(language: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&language)
}

pub fn language_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "py" => Some("python"),
        "js" | "mjs" => Some("javascript"),
        "cpp" | "cc" | "cxx" => Some("cpp"),
        "c" => Some("c"),
        "rs" => Some("rust"),
        _ => None,
    }
}

/// Hello-world template for a language; the CLI runs this when no
/// source file is given.
pub fn default_code(language: &str) -> &'static str {
    match language {
        "javascript" => "// Write your JavaScript code here\nconsole.log(\"Hello, World!\");",
        "cpp" => {
            "#include <iostream>\n\nint main() {\n    std::cout << \"Hello, World!\" << std::endl;\n    return 0;\n}"
        }
        "c" => "#include <stdio.h>\n\nint main() {\n    printf(\"Hello, World!\\n\");\n    return 0;\n}",
        "rust" => "fn main() {\n    println!(\"Hello, World!\");\n}",
        _ => "# Write your Python code here\nprint(\"Hello, World!\")",
    }
}
