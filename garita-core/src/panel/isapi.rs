//! Hikvision ISAPI client.
//!
//! Attribute calls use HTTP basic auth. Face photos go through the FDLib
//! upload endpoint, which wants the session token in the query and the
//! `WebSession` cookie instead.

use super::{AccessRecord, PanelClient, PanelEndpoint, PanelError, SessionToken};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use time::PrimitiveDateTime;
use time::macros::format_description;
use tracing::debug;
use url::Url;

const TOKEN_PATH: &str = "/ISAPI/Security/token?format=json";
const USER_SEARCH_PATH: &str = "/ISAPI/AccessControl/UserInfo/Search?format=json";
const USER_RECORD_PATH: &str = "/ISAPI/AccessControl/UserInfo/Record?format=json";
const USER_MODIFY_PATH: &str = "/ISAPI/AccessControl/UserInfo/Modify?format=json";
const USER_DELETE_PATH: &str = "/ISAPI/AccessControl/UserInfo/Delete?format=json";
const CARD_RECORD_PATH: &str = "/ISAPI/AccessControl/CardInfo/Record?format=json";
const FACE_SETUP_PATH: &str = "/ISAPI/Intelligent/FDLib/FDSetUp?format=json";

#[derive(Debug, Clone)]
pub struct IsapiClient {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DeviceStatus {
    #[serde(rename = "subStatusCode")]
    sub_status_code: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    #[serde(rename = "statusString")]
    status_string: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "Token")]
    token: TokenValue,
}

#[derive(Debug, Deserialize)]
struct TokenValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "UserInfoSearch")]
    search: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "totalMatches", default)]
    total_matches: u32,
}

impl IsapiClient {
    pub fn new(timeout: std::time::Duration) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PanelError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    async fn send_json(
        &self,
        endpoint: &PanelEndpoint,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<String, PanelError> {
        let url = endpoint_url(&endpoint.address, path)?;
        debug!(panel_id = %endpoint.id, %method, path, "ISAPI request");
        let response = self
            .http
            .request(method, url)
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        read_response(response).await
    }

    async fn upload_photo(
        &self,
        endpoint: &PanelEndpoint,
        code: &str,
        photo: &bytes::Bytes,
        session: &SessionToken,
    ) -> Result<(), PanelError> {
        let mut url = endpoint_url(&endpoint.address, FACE_SETUP_PATH)?;
        url.query_pairs_mut().append_pair("token", &session.token);

        let image = reqwest::multipart::Part::bytes(photo.to_vec())
            .file_name(format!("{code}.jpg"))
            .mime_str("image/jpeg")
            .map_err(|e| PanelError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("FaceDataRecord", face_data_record(code))
            .part("img", image);

        let mut request = self.http.put(url).multipart(form);
        if let Some(cookie) = &session.web_session {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        read_response(response).await.map(|_| ())
    }
}

#[async_trait]
impl PanelClient for IsapiClient {
    async fn authenticate(&self, endpoint: &PanelEndpoint) -> Result<SessionToken, PanelError> {
        let url = endpoint_url(&endpoint.address, TOKEN_PATH)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let web_session = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(web_session_cookie);
        let body = read_response(response).await?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| PanelError::Transport(format!("unexpected token response: {e}")))?;
        Ok(SessionToken {
            token: parsed.token.value,
            web_session,
        })
    }

    async fn upsert_access_record(
        &self,
        endpoint: &PanelEndpoint,
        record: &AccessRecord,
        session: Option<&SessionToken>,
    ) -> Result<(), PanelError> {
        let search = self
            .send_json(
                endpoint,
                Method::POST,
                USER_SEARCH_PATH,
                &search_body(&record.code, &uuid::Uuid::new_v4().to_string()),
            )
            .await?;
        let matches = serde_json::from_str::<SearchResponse>(&search)
            .map(|r| r.search.total_matches)
            .map_err(|e| PanelError::Transport(format!("unexpected search response: {e}")))?;

        let user = user_info_body(record)?;
        if matches == 0 {
            self.send_json(endpoint, Method::POST, USER_RECORD_PATH, &user)
                .await?;
            self.send_json(endpoint, Method::POST, CARD_RECORD_PATH, &card_body(&record.code))
                .await?;
        } else {
            self.send_json(endpoint, Method::PUT, USER_MODIFY_PATH, &user)
                .await?;
        }

        if let Some(photo) = &record.photo {
            let fetched;
            let session = match session {
                Some(session) => session,
                None => {
                    fetched = self.authenticate(endpoint).await?;
                    &fetched
                }
            };
            self.upload_photo(endpoint, &record.code, photo, session)
                .await?;
        }
        Ok(())
    }

    async fn delete_access_record(
        &self,
        endpoint: &PanelEndpoint,
        code: &str,
    ) -> Result<(), PanelError> {
        let result = self
            .send_json(endpoint, Method::PUT, USER_DELETE_PATH, &delete_body(code))
            .await;
        if delete_outcome(result)? == DeleteOutcome::AlreadyAbsent {
            debug!(panel_id = %endpoint.id, code, "Record already absent on panel");
        }
        Ok(())
    }
}

/// Base URL of a panel. Bare addresses are reached over plain HTTP.
fn endpoint_url(address: &str, path: &str) -> Result<Url, PanelError> {
    let base = if address.contains("://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    };
    Url::parse(&base)
        .and_then(|base| base.join(path))
        .map_err(|e| PanelError::Transport(format!("invalid panel address {address}: {e}")))
}

async fn read_response(response: reqwest::Response) -> Result<String, PanelError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| classify_transport(&e))?;
    classify_status(status, &body)?;
    Ok(body)
}

fn classify_status(status: StatusCode, body: &str) -> Result<(), PanelError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(PanelError::Auth);
    }
    if status.as_u16() >= 400 {
        return Err(PanelError::DeviceRejected {
            status: status.as_u16(),
            detail: device_detail(body),
        });
    }
    Ok(())
}

fn device_detail(body: &str) -> String {
    serde_json::from_str::<DeviceStatus>(body)
        .ok()
        .and_then(|s| s.sub_status_code.or(s.error_msg).or(s.status_string))
        .unwrap_or_else(|| "unknown device error".to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteOutcome {
    Removed,
    AlreadyAbsent,
}

/// A delete the device rejects because the record does not exist counts as
/// done.
fn delete_outcome(result: Result<String, PanelError>) -> Result<DeleteOutcome, PanelError> {
    match result {
        Ok(_) => Ok(DeleteOutcome::Removed),
        Err(PanelError::DeviceRejected { detail, .. }) if is_not_found(&detail) => {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
        Err(e) => Err(e),
    }
}

fn is_not_found(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    detail.contains("notexist") || detail.contains("not exist") || detail.contains("notfound")
}

fn classify_transport(error: &reqwest::Error) -> PanelError {
    if error.is_timeout() {
        return PanelError::Timeout;
    }
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut => return PanelError::Timeout,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return PanelError::ConnectionReset,
                _ => {}
            }
        }
        source = cause.source();
    }
    if error.is_connect() {
        return PanelError::ConnectionReset;
    }
    PanelError::Transport(error.to_string())
}

fn web_session_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    pair.starts_with("WebSession").then(|| pair.to_owned())
}

fn panel_time(at: PrimitiveDateTime) -> Result<String, PanelError> {
    at.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    ))
    .map_err(|e| PanelError::Transport(e.to_string()))
}

fn search_body(code: &str, search_id: &str) -> Value {
    json!({
        "UserInfoSearchCond": {
            "searchID": search_id,
            "maxResults": 1,
            "searchResultPosition": 0,
            "EmployeeNoList": [{ "employeeNo": code }]
        }
    })
}

fn user_info_body(record: &AccessRecord) -> Result<Value, PanelError> {
    Ok(json!({
        "UserInfo": {
            "employeeNo": record.code,
            "name": record.name,
            "userType": "visitor",
            "localUIRight": false,
            "Valid": {
                "enable": true,
                "beginTime": panel_time(record.valid_from)?,
                "endTime": panel_time(record.valid_to)?,
                "timeType": "local"
            },
            "doorRight": "1",
            "RightPlan": [{ "doorNo": 1, "planTemplateNo": "1" }],
            "userVerifyMode": ""
        }
    }))
}

fn card_body(code: &str) -> Value {
    json!({
        "CardInfo": {
            "employeeNo": code,
            "cardNo": code,
            "cardType": "normalCard"
        }
    })
}

fn delete_body(code: &str) -> Value {
    json!({
        "UserInfoDelCond": {
            "EmployeeNoList": [{ "employeeNo": code }]
        }
    })
}

fn face_data_record(code: &str) -> String {
    json!({ "faceLibType": "blackFD", "FDID": "1", "FPID": code }).to_string()
}
