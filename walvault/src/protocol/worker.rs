//! The worker side of the protocol: greeting, dispatch loop, and the engine
//! job handler.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Channel, Greeting, Request, Response};
use crate::errors::{Error, Result};
use crate::Context;

/// Executes one verb. Implementations must be cancel-safe; the loop exits
/// on channel close without draining in-flight work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, verb: &str, params: Value) -> Result<Value>;
}

/// Serve requests until a `shutdown` verb or channel close.
pub async fn serve<R, W>(
    mut channel: Channel<R, W>,
    handler: Arc<dyn JobHandler>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    channel.send(&Greeting::new()).await?;

    loop {
        let request: Request = match channel.recv().await {
            Ok(request) => request,
            // the controller went away; exit immediately
            Err(_) => return Ok(()),
        };

        match request.verb.as_str() {
            // the noop doubles as the readiness probe after greeting
            "noop" => {
                channel
                    .send(&Response::ok(request.seq, Value::Null))
                    .await?
            }
            "shutdown" => {
                channel
                    .send(&Response::ok(request.seq, Value::Null))
                    .await?;
                return Ok(());
            }
            verb => {
                let response = match handler.handle(verb, request.params).await {
                    Ok(payload) => Response::ok(request.seq, payload),
                    Err(e) => Response::err(request.seq, &e),
                };
                channel.send(&response).await?;
            }
        }
    }
}

/// Controller-side handshake: greeting, validation, readiness noop.
pub async fn handshake<R, W>(channel: &mut Channel<R, W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let greeting: Greeting = channel.recv().await?;
    greeting.check()?;

    channel
        .send(&Request {
            seq: 0,
            verb: "noop".into(),
            params: Value::Null,
        })
        .await?;
    let response: Response = channel.recv().await?;
    response.into_result()?;
    Ok(())
}

/// The handler behind local and remote workers: archive jobs expressed as
/// protocol verbs.
pub struct EngineHandler {
    ctx: Arc<Context>,
}

impl EngineHandler {
    pub fn new(ctx: Arc<Context>) -> Arc<EngineHandler> {
        Arc::new(EngineHandler { ctx })
    }
}

#[async_trait]
impl JobHandler for EngineHandler {
    async fn handle(&self, verb: &str, params: Value) -> Result<Value> {
        match verb {
            "wal-push" => {
                let wal_path = param_str(&params, "path")?;
                let outcome =
                    crate::archive::push::push_file(&self.ctx, Utf8PathBuf::from(wal_path).as_path())
                        .await?;
                Ok(json!({ "warnings": outcome.warnings }))
            }
            "wal-get" => {
                let name = param_str(&params, "name")?;
                let destination = param_str(&params, "destination")?;
                let found = crate::archive::get::get_file(
                    &self.ctx,
                    name,
                    Utf8PathBuf::from(destination).as_path(),
                )
                .await?;
                Ok(json!({ "found": found }))
            }
            other => Err(Error::Protocol(format!("unknown verb '{other}'"))),
        }
    }
}

fn param_str<'v>(params: &'v Value, key: &str) -> Result<&'v str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ParamRequired(format!("'{key}' parameter is required")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, verb: &str, params: Value) -> Result<Value> {
            match verb {
                "echo" => Ok(params),
                _ => Err(Error::Protocol(format!("unknown verb '{verb}'"))),
            }
        }
    }

    fn pair() -> (super::super::BoxChannel, super::super::BoxChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Channel::new(Box::new(ar) as _, Box::new(aw) as _),
            Channel::new(Box::new(br) as _, Box::new(bw) as _),
        )
    }

    #[tokio::test]
    async fn serve_handshake_dispatch_shutdown() {
        let (mut controller, worker) = pair();
        let server = tokio::spawn(serve(worker, Arc::new(Echo)));

        handshake(&mut controller).await.unwrap();

        controller
            .send(&Request {
                seq: 1,
                verb: "echo".into(),
                params: json!({"x": 42}),
            })
            .await
            .unwrap();
        let response: Response = controller.recv().await.unwrap();
        assert_eq!(response.into_result().unwrap()["x"], 42);

        controller
            .send(&Request {
                seq: 2,
                verb: "shutdown".into(),
                params: Value::Null,
            })
            .await
            .unwrap();
        let response: Response = controller.recv().await.unwrap();
        assert!(response.ok);

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_verb_is_a_protocol_error_response() {
        let (mut controller, worker) = pair();
        let server = tokio::spawn(serve(worker, Arc::new(Echo)));

        handshake(&mut controller).await.unwrap();
        controller
            .send(&Request {
                seq: 3,
                verb: "bogus".into(),
                params: Value::Null,
            })
            .await
            .unwrap();
        let response: Response = controller.recv().await.unwrap();
        assert!(!response.ok);
        assert_eq!(response.code, Some(102));

        drop(controller); // channel close ends the worker
        server.await.unwrap().unwrap();
    }
}
