use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct TwimlQuery {
    /// Overrides the media stream URL
    pub ws_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    pub to: Option<String>,
    pub from: Option<String>,
    /// Where the provider fetches call instructions; defaults to this server's `/twiml`
    pub callback_url: Option<String>,
}

/// Call instructions telling the provider to stream the call to `/media`.
pub async fn twiml(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<TwimlQuery>,
) -> HttpResponse {
    let stream_url = match &query.ws_url {
        Some(url) if !url.is_empty() => url.clone(),
        _ => format!("wss://{}/media", public_host(&req, &state)),
    };

    HttpResponse::Ok()
        .content_type("text/xml")
        .body(twiml_markup(&stream_url))
}

/// Place an outbound call whose audio is streamed back to this server.
pub async fn outbound_call(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<OutboundCallRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let to = required(body.to, "to")?;
    let from = required(body.from, "from")?;

    let config = state.get_config();
    let telephony = &config.telephony;
    if telephony.account_sid.is_empty() || telephony.auth_token.is_empty() {
        return Err(AppError::ConfigError(
            "Telephony account SID and auth token must be configured".to_string(),
        ));
    }

    let callback_url = body
        .callback_url
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| format!("https://{}/twiml", public_host(&req, &state)));

    let url = format!(
        "{}/2010-04-01/Accounts/{}/Calls.json",
        telephony.api_base.trim_end_matches('/'),
        telephony.account_sid
    );

    let response = state
        .http
        .post(&url)
        .basic_auth(&telephony.account_sid, Some(&telephony.auth_token))
        .form(&[("To", to.as_str()), ("From", from.as_str()), ("Url", callback_url.as_str())])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        error!(%status, "Telephony provider rejected outbound call: {}", detail);
        return Err(AppError::Upstream(format!(
            "Telephony provider returned {}",
            status
        )));
    }

    let created: Value = response.json().await?;
    let call_sid = created
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    info!(%call_sid, %to, "Outbound call queued");

    Ok(HttpResponse::Ok().json(json!({
        "status": "queued",
        "call_sid": call_sid,
    })))
}

fn required(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Missing required field '{}'", field)))
}

/// Configured public host, or the Host the request arrived on.
fn public_host(req: &HttpRequest, state: &AppState) -> String {
    let configured = state.get_config().server.public_host;
    if configured.is_empty() {
        req.connection_info().host().to_string()
    } else {
        configured
    }
}

fn twiml_markup(stream_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{}"/></Connect></Response>"#,
        xml_escape(stream_url)
    )
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
