use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use futures_util::StreamExt;
use reqwest::{
    Client, RequestBuilder, StatusCode,
    header::{ACCEPT, CACHE_CONTROL},
    multipart,
};
use serde_json::Value;
use sse_core::{
    FormData, FormPart, Params, RpcResponse, SessionError, SessionErrorCategory,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    rpc::{RpcBody, RpcFuture, RpcRequest, SessionRpc},
    sse::SseDecoder,
    transport::{
        AttemptSink, ConnectRequest, EventSourceConnector, EventSourceHandle, ReadyState,
        TransportEvent,
    },
};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Event-stream transport over a streaming `reqwest` GET.
#[derive(Clone, Debug, Default)]
pub struct HttpEventSource {
    client: Client,
    credentials: Params,
}

impl HttpEventSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            credentials: Params::new(),
        }
    }

    /// Headers attached only to attempts opened with credentials.
    pub fn with_credentials(mut self, credentials: Params) -> Self {
        self.credentials = credentials;
        self
    }
}

impl EventSourceConnector for HttpEventSource {
    fn open(&self, request: ConnectRequest, sink: AttemptSink) -> Box<dyn EventSourceHandle> {
        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let handle = HttpEventSourceHandle {
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        };

        let mut builder = self
            .client
            .get(request.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if request.with_credentials {
            builder = apply_headers(builder, &self.credentials);
        }

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(pump(builder, sink, state, cancel));
            }
            Err(err) => {
                state.store(STATE_CLOSED, Ordering::SeqCst);
                sink.emit(TransportEvent::Error(format!("no async runtime: {err}")));
            }
        }
        Box::new(handle)
    }
}

async fn pump(
    builder: RequestBuilder,
    sink: AttemptSink,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    let attempt = sink.attempt();
    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = builder.send() => response.and_then(|response| response.error_for_status()),
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            state.store(STATE_CLOSED, Ordering::SeqCst);
            debug!(attempt, error = %err, "event stream request failed");
            sink.emit(TransportEvent::Error(err.to_string()));
            return;
        }
    };

    state.store(STATE_OPEN, Ordering::SeqCst);
    if !sink.emit(TransportEvent::Open) {
        return;
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    trace!(attempt, event = %event.name, "event stream message");
                    if !sink.emit(TransportEvent::Message(event)) {
                        state.store(STATE_CLOSED, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                state.store(STATE_CLOSED, Ordering::SeqCst);
                sink.emit(TransportEvent::Error(err.to_string()));
                return;
            }
            None => {
                state.store(STATE_CLOSED, Ordering::SeqCst);
                sink.emit(TransportEvent::Error("event stream ended".to_owned()));
                return;
            }
        }
    }
    state.store(STATE_CLOSED, Ordering::SeqCst);
}

#[derive(Debug)]
struct HttpEventSourceHandle {
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
}

impl EventSourceHandle for HttpEventSourceHandle {
    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}

impl Drop for HttpEventSourceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Outbound calls over `reqwest`: JSON and multipart POSTs plus a
/// form-encoded beacon.
#[derive(Clone, Debug, Default)]
pub struct HttpRpc {
    client: Client,
    credentials: Params,
}

impl HttpRpc {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            credentials: Params::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Params) -> Self {
        self.credentials = credentials;
        self
    }
}

impl SessionRpc for HttpRpc {
    fn call(&self, request: RpcRequest) -> Result<RpcFuture, SessionError> {
        let mut builder = apply_headers(self.client.post(request.url), &request.headers);
        if request.with_credentials {
            builder = apply_headers(builder, &self.credentials);
        }
        builder = match request.body {
            RpcBody::Json(body) => builder.json(&body),
            RpcBody::Multipart(form) => builder.multipart(multipart_form(form)?),
        };
        let request = builder.build().map_err(|err| {
            SessionError::validation(format!("cannot build request: {err}"))
        })?;

        let client = self.client.clone();
        Ok(Box::pin(async move {
            let response = client.execute(request).await.map_err(map_reqwest_error)?;
            let status = response.status();
            let text = response.text().await.map_err(map_reqwest_error)?;
            if !status.is_success() {
                return Err(SessionError::http_status(
                    status.as_u16(),
                    status_message(status, &text),
                ));
            }
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            Ok(RpcResponse {
                status: status.as_u16(),
                body,
            })
        }))
    }

    fn beacon(&self, url: Url, form: Params) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available for disconnect beacon");
            return false;
        };
        let request = self.client.post(url).form(&form);
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) => debug!(status = %response.status(), "disconnect beacon delivered"),
                Err(err) => debug!(error = %err, "disconnect beacon failed"),
            }
        });
        true
    }
}

fn apply_headers(mut builder: RequestBuilder, headers: &Params) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn multipart_form(form: FormData) -> Result<multipart::Form, SessionError> {
    form.validate()?;
    let mut multipart = multipart::Form::new();
    for part in form.parts().iter().cloned() {
        multipart = match part {
            FormPart::Text { name, value } => multipart.text(name, value),
            FormPart::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                let mut file = multipart::Part::bytes(bytes).file_name(file_name);
                if let Some(content_type) = content_type {
                    file = file.mime_str(&content_type).map_err(|err| {
                        SessionError::validation(format!(
                            "invalid content type '{content_type}': {err}"
                        ))
                    })?;
                }
                multipart.part(name, file)
            }
        };
    }
    Ok(multipart)
}

fn status_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SessionError {
    if let Some(status) = err.status() {
        return SessionError::http_status(status.as_u16(), err.to_string());
    }
    let category = if err.is_timeout() || err.is_connect() || err.is_request() {
        SessionErrorCategory::Network
    } else if err.is_decode() || err.is_body() {
        SessionErrorCategory::Serialization
    } else if err.is_builder() {
        SessionErrorCategory::Config
    } else {
        SessionErrorCategory::Internal
    };
    SessionError::new(category, "http", err.to_string())
}
