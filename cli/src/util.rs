use serde_json::json;
use uuid::Uuid;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn to_pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", to_pretty(&err));
    std::process::exit(4);
}

/// Who the CLI acts as on caller routes. Normally injected by the gateway;
/// the CLI sends the same headers directly.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

impl Caller {
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-user-id".to_string(), self.user_id.to_string()),
            ("x-organization-id".to_string(), self.organization_id.to_string()),
        ]
    }
}

pub fn require_caller(user_id: Option<Uuid>, organization_id: Option<Uuid>) -> Caller {
    match (user_id, organization_id) {
        (Some(user_id), Some(organization_id)) => Caller {
            user_id,
            organization_id,
        },
        _ => exit_error(
            "user and organization are required for chat operations",
            Some("Set --user-id/--organization-id or CHATGUARD_USER_ID/CHATGUARD_ORGANIZATION_ID."),
        ),
    }
}

pub fn require_operator_token(token: Option<&str>) -> &str {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => exit_error(
            "operator token is required for this command",
            Some("Set CHATGUARD_OPERATOR_TOKEN. Generate one with `chatguard admin token`."),
        ),
    }
}

/// Map an HTTP status to the CLI exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub fn exit_code_for(status: u16) -> i32 {
    match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    }
}

pub fn build_url(api_url: &str, path: &str, query: &[(String, String)]) -> Result<reqwest::Url, String> {
    let base = api_url.trim_end_matches('/');
    let mut url = reqwest::Url::parse(&format!("{base}{path}"))
        .map_err(|e| format!("Invalid URL: {base}{path}: {e}"))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

/// Execute an API request, print the response and return the exit code.
#[allow(clippy::too_many_arguments)]
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
    extra_headers: &[(String, String)],
    include: bool,
) -> i32 {
    let url = match build_url(api_url, path, query) {
        Ok(u) => u,
        Err(message) => {
            eprintln!("{}", to_pretty(&json!({"error": "cli_error", "message": message})));
            return 4;
        }
    };

    let mut req = client().request(method, url);

    if let Some(t) = token {
        req = req.bearer_auth(t);
    }

    for (k, v) in extra_headers {
        req = req.header(k.as_str(), v.as_str());
    }

    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check CHATGUARD_API_URL."
            });
            eprintln!("{}", to_pretty(&err));
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for(status);

    // Collect headers before consuming response
    let headers: serde_json::Map<String, serde_json::Value> = if include {
        resp.headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or("<binary>"))))
            .collect()
    } else {
        serde_json::Map::new()
    };

    let resp_body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let output = if include {
        json!({
            "status": status,
            "headers": headers,
            "body": resp_body
        })
    } else {
        resp_body
    };

    if exit_code == 0 {
        println!("{}", to_pretty(&output));
    } else {
        eprintln!("{}", to_pretty(&output));
    }

    exit_code
}

/// Read JSON from a file path or stdin (when path is "-").
pub fn read_json_from_file(path: &str) -> Result<serde_json::Value, String> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin())
            .map_err(|e| format!("Failed to read stdin: {e}"))?
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}
