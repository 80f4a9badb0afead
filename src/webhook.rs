//! Admission webhook server.
//!
//! HTTPS endpoint receiving Kubernetes `AdmissionReview` envelopes. Each
//! configured resource gets `/{group}/{version}/{plural}/validate`,
//! `/.../mutate` and `/.../inject` routes bound to its handlers. Handler
//! failures surface as `allowed=false` with the failure message — never as
//! 5xx, so admission decisions stay deterministic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use crate::handler::{self, Handler};
use crate::inject::PatchVerifier;
use crate::object;

/// How a route treats the handler's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Validate,
    Mutate,
    Inject,
}

/// One bound admission route.
struct Route {
    kind: RouteKind,
    handler: Arc<dyn Handler>,
    verifier: Option<PatchVerifier>,
}

type Routes = Arc<HashMap<String, Route>>;

/// The admission HTTPS server.
pub struct AdmissionServer {
    config: WebhookConfig,
    routes: Routes,
}

impl AdmissionServer {
    /// Resolve handlers and verification keys from configuration.
    pub fn from_config(config: &WebhookConfig) -> Result<AdmissionServer> {
        let mut routes = HashMap::new();

        for binding in &config.handlers {
            let resource = object::api_resource(&binding.resource);
            let prefix = format!(
                "/{}/{}/{}",
                binding.resource.group, binding.resource.version, resource.plural
            );

            if let Some(validator) = &binding.validator {
                routes.insert(
                    format!("{prefix}/validate"),
                    Route {
                        kind: RouteKind::Validate,
                        handler: handler::build(validator)?,
                        verifier: None,
                    },
                );
            }
            if let Some(mutator) = &binding.mutator {
                routes.insert(
                    format!("{prefix}/mutate"),
                    Route {
                        kind: RouteKind::Mutate,
                        handler: handler::build(mutator)?,
                        verifier: None,
                    },
                );
            }
            if let Some(injector) = &binding.injector {
                routes.insert(
                    format!("{prefix}/inject"),
                    Route {
                        kind: RouteKind::Inject,
                        handler: handler::build(&injector.handler)?,
                        verifier: Some(PatchVerifier::from_pem_file(&injector.verify_key_file)?),
                    },
                );
            }
        }

        Ok(AdmissionServer {
            config: config.clone(),
            routes: Arc::new(routes),
        })
    }

    /// Serve until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("webhook: tls must be specified".into()))?;

        let cert_pem = std::fs::read(&tls.cert_file)?;
        let key_pem = std::fs::read(&tls.key_file)?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidConfig(format!("invalid server certificate: {e}")))?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| Error::InvalidConfig(format!("invalid server key: {e}")))?
            .ok_or_else(|| Error::InvalidConfig("no private key found in PEM file".into()))?;

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::InvalidConfig(format!("invalid TLS configuration: {e}")))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

        let host = if self.config.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.config.host
        };
        let addr: SocketAddr = format!("{host}:{}", self.config.port)
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid webhook address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, routes = self.routes.len(), "admission server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping admission server");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let acceptor = acceptor.clone();
            let routes = self.routes.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = hyper_util::rt::TokioIo::new(tls_stream);
                        let service = hyper::service::service_fn(move |req| {
                            let routes = routes.clone();
                            async move { handle_request(routes, req).await }
                        });
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "connection error");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "TLS handshake failed");
                    }
                }
            });
        }
    }
}

async fn handle_request(
    routes: Routes,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    let response = match (req.method().clone(), routes.get(&path)) {
        (Method::POST, Some(route)) => admit(route, req).await,
        (Method::GET, _) if path == "/healthz" => plain(StatusCode::OK, "OK"),
        (Method::GET, _) if path == "/readyz" => plain(StatusCode::OK, "Ready"),
        (_, Some(_)) => plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// The handler's decision, as returned over the transport. The patch is kept
/// as raw bytes so the injector signature covers exactly what the handler
/// produced.
#[derive(Deserialize)]
struct Decision {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    patch: Option<Box<RawValue>>,
    #[serde(default)]
    signature: Option<String>,
}

async fn admit(route: &Route, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read admission request body");
            return plain(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let review: Value = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "invalid AdmissionReview");
            return plain(StatusCode::BAD_REQUEST, "invalid AdmissionReview");
        }
    };

    let request = review.get("request").cloned().unwrap_or(Value::Null);
    if !request.is_object() {
        error!("AdmissionReview is missing its request");
        return plain(StatusCode::BAD_REQUEST, "missing request in AdmissionReview");
    }
    let uid = request
        .get("uid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let api_version = review
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("admission.k8s.io/v1")
        .to_string();

    let response = match decide(route, &request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "admission handler failed");
            denial(e.to_string())
        }
    };

    let envelope = json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "response": with_uid(response, uid),
    });

    match serde_json::to_vec(&envelope) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to build admission response");
                Response::new(Full::new(Bytes::from("Internal Error")))
            }),
        Err(e) => {
            error!(error = %e, "failed to serialize admission response");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "serialization failure")
        }
    }
}

/// Run the handler and translate its decision into an `AdmissionResponse`
/// body (without the uid, which the caller attaches).
async fn decide(route: &Route, request: &Value) -> Result<Value> {
    let payload = json!({
        "request": request,
        "object": request.get("object").cloned().unwrap_or(Value::Null),
        "oldObject": request.get("oldObject").cloned().unwrap_or(Value::Null),
    });

    let response_bytes = route.handler.invoke(&serde_json::to_vec(&payload)?).await?;
    let decision: Decision = serde_json::from_slice(&response_bytes)
        .map_err(|e| Error::MalformedOutput(format!("admission response: {e}")))?;

    if !decision.allowed {
        return Ok(denial(decision.message));
    }

    let mut response = json!({"allowed": true});
    if !decision.message.is_empty() {
        response["status"] = json!({"message": decision.message});
    }

    if let Some(patch) = &decision.patch {
        let patch_bytes = patch.get().as_bytes();

        // A patch must be a JSONPatch array, whatever the route kind.
        let parsed: Value = serde_json::from_slice(patch_bytes)
            .map_err(|e| Error::MalformedOutput(format!("patch: {e}")))?;
        if !parsed.is_array() {
            return Err(Error::MalformedOutput("patch is not a JSONPatch array".into()));
        }

        match route.kind {
            RouteKind::Validate => {
                // Validators have no business patching; ignore silently.
            }
            RouteKind::Mutate => {
                response["patch"] = json!(BASE64.encode(patch_bytes));
                response["patchType"] = json!("JSONPatch");
            }
            RouteKind::Inject => {
                let verifier = route
                    .verifier
                    .as_ref()
                    .ok_or_else(|| Error::Unrecoverable("injector route without verifier".into()))?;
                let Some(signature) = &decision.signature else {
                    return Ok(denial("patch is not signed".to_string()));
                };
                if let Err(e) = verifier.verify(patch_bytes, signature) {
                    return Ok(denial(e.to_string()));
                }
                response["patch"] = json!(BASE64.encode(patch_bytes));
                response["patchType"] = json!("JSONPatch");
            }
        }
    }

    Ok(response)
}

fn denial(message: String) -> Value {
    json!({
        "allowed": false,
        "status": {"message": message},
    })
}

fn with_uid(mut response: Value, uid: String) -> Value {
    response["uid"] = json!(uid);
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Error"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};

    fn route(kind: RouteKind, response: &'static str) -> Route {
        Route {
            kind,
            handler: Arc::new(FnHandler::new(move |_| Ok(response.as_bytes().to_vec()))),
            verifier: None,
        }
    }

    fn request() -> Value {
        json!({
            "uid": "req-1",
            "operation": "CREATE",
            "object": {"kind": "Hello", "metadata": {"name": "x"}},
            "oldObject": null,
        })
    }

    #[tokio::test]
    async fn validator_denial_carries_the_message() {
        let route = route(RouteKind::Validate, r#"{"allowed": false, "message": "nope"}"#);
        let response = decide(&route, &request()).await.unwrap();
        assert_eq!(response["allowed"], json!(false));
        assert_eq!(response["status"]["message"], json!("nope"));
    }

    #[tokio::test]
    async fn validator_allow_is_plain() {
        let route = route(RouteKind::Validate, r#"{"allowed": true}"#);
        let response = decide(&route, &request()).await.unwrap();
        assert_eq!(response, json!({"allowed": true}));
    }

    #[tokio::test]
    async fn mutator_patch_is_base64_jsonpatch() {
        let patch = r#"[{"op":"add","path":"/metadata/labels","value":{"a":"b"}}]"#;
        let body: &'static str = Box::leak(
            format!(r#"{{"allowed": true, "patch": {patch}}}"#).into_boxed_str(),
        );
        let route = route(RouteKind::Mutate, body);
        let response = decide(&route, &request()).await.unwrap();
        assert_eq!(response["allowed"], json!(true));
        assert_eq!(response["patchType"], json!("JSONPatch"));
        let decoded = BASE64
            .decode(response["patch"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, patch.as_bytes());
    }

    #[tokio::test]
    async fn handler_failure_becomes_denial() {
        let failing = Route {
            kind: RouteKind::Validate,
            handler: Arc::new(FnHandler::new(|_| {
                Err(Error::Transport("handler down".into()))
            })),
            verifier: None,
        };
        let err = decide(&failing, &request()).await.unwrap_err();
        // admit() converts the error into allowed=false.
        let denial = denial(err.to_string());
        assert_eq!(denial["allowed"], json!(false));
        assert!(
            denial["status"]["message"]
                .as_str()
                .unwrap()
                .contains("handler down")
        );
    }

    #[tokio::test]
    async fn non_array_patch_is_malformed() {
        let route = route(
            RouteKind::Mutate,
            r#"{"allowed": true, "patch": {"op": "add"}}"#,
        );
        let err = decide(&route, &request()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn injector_requires_a_valid_signature() {
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let patch = r#"[{"op":"add","path":"/a","value":1}]"#;
        let signature = BASE64.encode(signing.sign(patch.as_bytes()).to_bytes());

        let signed_body: &'static str = Box::leak(
            format!(r#"{{"allowed": true, "patch": {patch}, "signature": "{signature}"}}"#)
                .into_boxed_str(),
        );
        let mut route = route(RouteKind::Inject, signed_body);
        route.verifier = Some(PatchVerifier::new(signing.verifying_key()));

        let response = decide(&route, &request()).await.unwrap();
        assert_eq!(response["allowed"], json!(true));
        assert_eq!(response["patchType"], json!("JSONPatch"));

        // Unsigned patch: denied even though the handler allowed.
        let unsigned_body: &'static str = Box::leak(
            format!(r#"{{"allowed": true, "patch": {patch}}}"#).into_boxed_str(),
        );
        let mut unsigned = Route {
            kind: RouteKind::Inject,
            handler: Arc::new(FnHandler::new(move |_| {
                Ok(unsigned_body.as_bytes().to_vec())
            })),
            verifier: Some(PatchVerifier::new(signing.verifying_key())),
        };
        let response = decide(&unsigned, &request()).await.unwrap();
        assert_eq!(response["allowed"], json!(false));

        // Wrong key: denied.
        let other = SigningKey::from_bytes(&[1u8; 32]);
        unsigned.handler = Arc::new(FnHandler::new(move |_| {
            Ok(signed_body.as_bytes().to_vec())
        }));
        unsigned.verifier = Some(PatchVerifier::new(other.verifying_key()));
        let response = decide(&unsigned, &request()).await.unwrap();
        assert_eq!(response["allowed"], json!(false));
    }
}
