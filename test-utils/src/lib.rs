//! `test-utils` is used for testing in both `gambit-lib` and `gambit-bin`.
//! This crate does not depend on either of them, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock provider, which responds to every GET request with a
/// predefined status.
///
/// Further arguments are applied to the `ResponseTemplate`:
///
/// ```ignore
/// let server = mock_provider!(200, set_body_string("[]"));
/// ```
#[macro_export]
macro_rules! mock_provider {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new($status);
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(template)
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// Create a mock provider answering every GET request with a JSON body
#[macro_export]
macro_rules! json_provider {
    ($body:expr) => {
        $crate::mock_provider!(200, set_body_raw($body, "application/json"))
    };
}

/// Create a mock provider which is rate limiting us: every GET request gets
/// `429 Too Many Requests`, with a `Retry-After` header if one is given.
#[macro_export]
macro_rules! throttling_provider {
    () => {
        $crate::mock_provider!(429)
    };
    ($retry_after:expr) => {
        $crate::mock_provider!(429, insert_header("retry-after", $retry_after))
    };
}

/// Create a mock provider which delays every response by `$delay` and
/// records each request
#[macro_export]
macro_rules! slow_provider {
    ($delay:expr) => {
        $crate::mock_provider!(200, set_body_string("{}"), set_delay($delay))
    };
}

/// Get the root path of the workspace.
#[macro_export]
macro_rules! root_path {
    () => {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .to_path_buf()
    };
}

/// Load a file relative to the workspace root
#[macro_export]
macro_rules! load_workspace_file {
    ($filename:expr) => {{
        let path = $crate::root_path!().join($filename);
        std::fs::read_to_string(path).unwrap()
    }};
}
