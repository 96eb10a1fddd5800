use http::HeaderMap;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

/// Per-request correlation data attached to every forwarded request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: Option<String>,
    pub proto: String,
}

impl RequestContext {
    /// Build from inbound headers, reusing an upstream request id when one is
    /// already present so traces stay joined across hops.
    pub fn from_headers(headers: &HeaderMap, client_addr: Option<String>) -> Self {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4()));

        Self {
            request_id,
            client_addr,
            proto: "http".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn generates_request_id_when_absent() {
        let ctx = RequestContext::from_headers(&HeaderMap::new(), None);
        assert!(ctx.request_id.starts_with("req_"));
    }

    #[test]
    fn reuses_upstream_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req_upstream"));
        let ctx = RequestContext::from_headers(&headers, Some("10.0.0.9:4122".into()));
        assert_eq!(ctx.request_id, "req_upstream");
        assert_eq!(ctx.client_addr.as_deref(), Some("10.0.0.9:4122"));
    }
}
