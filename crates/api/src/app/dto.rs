//! Request bodies and query strings of the job endpoints.

use serde::Deserialize;
use serde_json::Value;

use jobservice_core::{JobRequest, PageQuery, ServiceError};

/// Decode a submission body.
///
/// Accepts the flat request, the same request wrapped as `{"job": {...}}`,
/// and a `kind` given next to `name` instead of inside `metadata`.
pub fn parse_job_request(body: &[u8]) -> Result<JobRequest, ServiceError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::bad_request("malformed job request body").with_cause(e))?;

    if let Some(inner) = value.get_mut("job").filter(|v| v.is_object()).map(Value::take) {
        value = inner;
    }
    let Value::Object(ref mut fields) = value else {
        return Err(ServiceError::bad_request("job request must be a JSON object"));
    };
    if let Some(kind) = fields.remove("kind") {
        let metadata = fields
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(meta) = metadata {
            meta.entry("kind").or_insert(kind);
        }
    }

    serde_json::from_value(value)
        .map_err(|e| ServiceError::bad_request("invalid job request").with_cause(e))
}

#[derive(Debug, Deserialize)]
pub struct JobActionRequest {
    pub action: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
    #[serde(default)]
    pub non_stopped_only: Option<bool>,
    /// Older spelling of `non_stopped_only`.
    #[serde(default)]
    pub non_dead_only: Option<bool>,
}

impl PageParams {
    pub fn to_query(&self) -> PageQuery {
        let open_only = self.non_stopped_only.or(self.non_dead_only).unwrap_or(false);
        PageQuery::new(self.page_number, self.page_size, open_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobservice_core::JobKind;

    #[test]
    fn envelope_and_top_level_kind_are_accepted() {
        let req = parse_job_request(
            br#"{"job":{"name":"SAMPLE","kind":"periodic","metadata":{"cron":"0 */5 * * * *"}}}"#,
        )
        .unwrap();
        assert_eq!(req.name, "SAMPLE");
        assert_eq!(req.metadata.kind, JobKind::Periodic);
        assert_eq!(req.metadata.cron.as_deref(), Some("0 */5 * * * *"));
    }

    #[test]
    fn metadata_kind_wins_over_top_level() {
        let req = parse_job_request(
            br#"{"name":"SAMPLE","kind":"periodic","metadata":{"kind":"generic"}}"#,
        )
        .unwrap();
        assert_eq!(req.metadata.kind, JobKind::Generic);
    }

    #[test]
    fn garbage_is_a_bad_request() {
        assert!(parse_job_request(b"{not json").is_err());
        assert!(parse_job_request(b"[1,2]").is_err());
        assert!(parse_job_request(br#"{"parameters":{}}"#).is_err());
    }

    #[test]
    fn page_params_accept_the_old_filter_name() {
        let params: PageParams =
            serde_json::from_str(r#"{"page_number":2,"page_size":500,"non_dead_only":true}"#).unwrap();
        let query = params.to_query();
        assert_eq!(query.page_number, 2);
        assert_eq!(query.page_size, 100);
        assert!(query.non_stopped_only);
    }
}
