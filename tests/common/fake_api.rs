use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use textassembler_processor::api::{
    ApiError, ApiResponse, ContentApi, DownloadRequest, ResultPage,
};
use textassembler_processor::rate_limit::{CallClass, RateLimitHeaders};

/// Serves `total` numbered documents, `top` at a time, unless an error was
/// queued for the next call.
pub struct FakeContentApi {
    total: i64,
    requests: Mutex<Vec<DownloadRequest>>,
    scripted: Mutex<VecDeque<ApiError>>,
    headers: Mutex<Option<RateLimitHeaders>>,
    /// Documents served without content.
    broken: Mutex<Vec<i64>>,
    sources: Mutex<Vec<(i64, String)>>,
    source_skips: Mutex<Vec<i64>>,
}

#[allow(dead_code)]
impl FakeContentApi {
    pub fn shared(total: i64) -> Arc<Self> {
        Arc::new(Self {
            total,
            requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            headers: Mutex::new(Some(RateLimitHeaders::new(
                "10/100/1000",
                "9/99/999",
                "60/3600/86400",
            ))),
            broken: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            source_skips: Mutex::new(Vec::new()),
        })
    }

    /// Sources listed by the `Sources` resource, in order.
    pub fn set_sources(&self, names: &[&str]) {
        *self.sources.lock().unwrap() = names
            .iter()
            .enumerate()
            .map(|(i, name)| (i as i64 + 1, name.to_string()))
            .collect();
    }

    /// `$skip` of every sources request made so far.
    pub fn source_skips(&self) -> Vec<i64> {
        self.source_skips.lock().unwrap().clone()
    }

    pub fn fail_next(&self, err: ApiError) {
        self.scripted.lock().unwrap().push_back(err);
    }

    pub fn set_headers(&self, headers: Option<RateLimitHeaders>) {
        *self.headers.lock().unwrap() = headers;
    }

    pub fn break_document(&self, index: i64) {
        self.broken.lock().unwrap().push(index);
    }

    /// `$skip` of every download request made so far.
    pub fn skips(&self) -> Vec<i64> {
        self.requests.lock().unwrap().iter().map(|r| r.skip).collect()
    }

    pub fn requests(&self) -> Vec<DownloadRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn document(&self, index: i64) -> serde_json::Value {
        if self.broken.lock().unwrap().contains(&index) {
            return json!({ "ResultId": format!("doc-{}", index) });
        }
        json!({
            "ResultId": format!("doc-{}", index),
            "Document": {
                "Content": format!(
                    "<html><head><title>Title {i}</title></head><body><h1>Headline {i}</h1><bodytext>Body {i}</bodytext></body></html>",
                    i = index
                )
            }
        })
    }
}

#[async_trait]
impl ContentApi for FakeContentApi {
    async fn authenticate(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn download(&self, request: &DownloadRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }

        let end = (request.skip + request.top).min(self.total);
        let value = (request.skip..end).map(|i| self.document(i)).collect();
        Ok(ApiResponse {
            request_url: format!("test://News?$skip={}&$top={}", request.skip, request.top),
            status: 200,
            page: ResultPage {
                total: self.total,
                value,
            },
            rate_limits: self.headers.lock().unwrap().clone(),
        })
    }

    async fn sources(&self, skip: i64, top: i64) -> Result<ApiResponse, ApiError> {
        self.source_skips.lock().unwrap().push(skip);
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }

        let sources = self.sources.lock().unwrap();
        let value = sources
            .iter()
            .skip(skip as usize)
            .take(top as usize)
            .map(|(id, name)| json!({ "Id": id, "Name": name }))
            .collect();
        Ok(ApiResponse {
            request_url: format!("test://Sources?$skip={}&$top={}", skip, top),
            status: 200,
            page: ResultPage {
                total: sources.len() as i64,
                value,
            },
            rate_limits: self.headers.lock().unwrap().clone(),
        })
    }

    async fn sample_quota(&self, class: CallClass) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse {
            request_url: format!("test://{}", class.as_str()),
            status: 200,
            page: ResultPage::default(),
            rate_limits: self.headers.lock().unwrap().clone(),
        })
    }
}
