use reqwest::{blocking::Client, header::CONTENT_TYPE};

use crate::{
    foundation::{
        config::WorkerConfig,
        error::{WorkerError, WorkerResult},
    },
    protocol::{Coordinator, FILE_HEADER, GROUP_HEADER, PullResponse, PushRequest, RATIO_HEADER},
};

pub const COMPUTE_PATH: &str = "compute";
pub const SUMMARY_PATH: &str = "compute/summary";

/// `reqwest` blocking transport to the coordinator.
#[derive(Clone, Debug)]
pub struct HttpCoordinator {
    client: Client,
    base_url: String,
}

/// Coordinator base URL with a scheme and a trailing slash.
///
/// The client is built without a TLS backend, so only plain `http` is accepted.
pub fn normalize_base_url(server: &str) -> WorkerResult<String> {
    let server = server.trim();
    if server.is_empty() {
        return Err(WorkerError::config("server address must be non-empty"));
    }
    let mut url = match server.split_once("://") {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("http") => server.to_string(),
        Some((scheme, _)) => {
            return Err(WorkerError::config(format!(
                "unsupported scheme '{scheme}' in server address, only http is available"
            )));
        }
        None => format!("http://{server}"),
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    Ok(url)
}

fn header(resp: &reqwest::blocking::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl HttpCoordinator {
    pub fn new(cfg: &WorkerConfig) -> WorkerResult<Self> {
        // `None` leaves requests unbounded, overriding reqwest's 30s default.
        let client = Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| WorkerError::config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&cfg.server)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Coordinator for HttpCoordinator {
    fn pull(&self, session: Option<&str>) -> WorkerResult<PullResponse> {
        let mut req = self.client.get(self.url(COMPUTE_PATH));
        if let Some(id) = session {
            req = req.query(&[("id", id)]);
        }
        let resp = req.send()?;
        let status = resp.status().as_u16();
        let group = header(&resp, GROUP_HEADER);
        let file = header(&resp, FILE_HEADER);
        let body = resp.bytes()?.to_vec();
        Ok(PullResponse {
            status,
            group,
            file,
            body,
        })
    }

    fn push(&self, req: &PushRequest) -> WorkerResult<u16> {
        let mut query = vec![("path", req.path.as_str())];
        if let Some(id) = req.session.as_deref() {
            query.push(("id", id));
        }
        let resp = self
            .client
            .put(self.url(COMPUTE_PATH))
            .query(&query)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(RATIO_HEADER, req.ratio.to_string())
            .body(req.body.clone())
            .send()?;
        Ok(resp.status().as_u16())
    }

    fn summary(&self, session: Option<&str>) -> WorkerResult<u16> {
        let mut req = self.client.get(self.url(SUMMARY_PATH));
        if let Some(id) = session {
            req = req.query(&[("id", id)]);
        }
        Ok(req.send()?.status().as_u16())
    }
}
