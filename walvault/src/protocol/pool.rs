//! The worker pool: N protocol workers behind a shared job queue.
//!
//! Jobs are opaque `(verb, params)` pairs; the pool hands each to the next
//! free worker and completes the submitter's oneshot with the parsed
//! response. Cancellation is cooperative: shutdown broadcasts the shutdown
//! verb and drops the channels, and workers exit on channel close.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::worker::{handshake, serve, JobHandler};
use super::{BoxChannel, Channel, Request, Response};
use crate::errors::{Error, Result};

struct Job {
    verb: String,
    params: Value,
    result_tx: oneshot::Sender<Result<Value>>,
}

pub struct WorkerPool {
    job_tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Build a pool over pre-established channels (one per worker), e.g.
    /// spawned processes or remote connections.
    pub async fn from_channels(channels: Vec<BoxChannel>, cancel: CancellationToken) -> Result<WorkerPool> {
        if channels.is_empty() {
            return Err(Error::Assert("worker pool needs at least one worker".into()));
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>(channels.len() * 2);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(channels.len());
        for (worker_id, mut channel) in channels.into_iter().enumerate() {
            handshake(&mut channel).await?;

            let job_rx = Arc::clone(&job_rx);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                let mut seq = 0u64;
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(job) = job else {
                        // queue closed or cancelled: tell the worker to exit
                        let _ = channel
                            .send(&Request {
                                seq: seq + 1,
                                verb: "shutdown".into(),
                                params: Value::Null,
                            })
                            .await;
                        let _ = channel.recv::<Response>().await;
                        return;
                    };

                    seq += 1;
                    match run_job(&mut channel, seq, &job).await {
                        // job-level errors go back to the submitter; the
                        // worker keeps serving
                        Ok(job_result) => {
                            let _ = job.result_tx.send(job_result);
                        }
                        // a broken channel cannot carry further jobs
                        Err(channel_err) => {
                            tracing::warn!(
                                "worker {worker_id} channel failed, worker retired: {channel_err}"
                            );
                            let _ = job.result_tx.send(Err(channel_err));
                            return;
                        }
                    }
                }
            }));
        }

        Ok(WorkerPool {
            job_tx,
            workers,
            cancel,
        })
    }

    /// An in-process pool: workers are tokio tasks running the same serve
    /// loop over duplex pipes. Used when spawning real processes buys
    /// nothing (tests, single-host runs).
    pub async fn in_process(
        handler: Arc<dyn JobHandler>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Result<WorkerPool> {
        let mut channels = Vec::with_capacity(workers);
        for _ in 0..workers.max(1) {
            let (controller_io, worker_io) = tokio::io::duplex(1024 * 1024);
            let (cr, cw) = tokio::io::split(controller_io);
            let (wr, ww) = tokio::io::split(worker_io);

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let channel = Channel::new(wr, ww);
                if let Err(e) = serve(channel, handler).await {
                    tracing::warn!("in-process worker failed: {e}");
                }
            });

            channels.push(Channel::new(
                Box::new(cr) as Box<dyn tokio::io::AsyncRead + Send + Unpin>,
                Box::new(cw) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
            ));
        }
        Self::from_channels(channels, cancel).await
    }

    /// Run one job to completion on any worker.
    pub async fn run(&self, verb: &str, params: Value) -> Result<Value> {
        let (result_tx, result_rx) = oneshot::channel();
        self.job_tx
            .send(Job {
                verb: verb.to_string(),
                params,
                result_tx,
            })
            .await
            .map_err(|_| Error::Protocol("worker pool is shut down".into()))?;
        result_rx
            .await
            .map_err(|_| Error::Protocol("worker died before completing the job".into()))?
    }

    /// Broadcast shutdown and wait for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.job_tx);
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Outer error: the channel is unusable. Inner result: the job's outcome.
async fn run_job(channel: &mut BoxChannel, seq: u64, job: &Job) -> Result<Result<Value>> {
    channel
        .send(&Request {
            seq,
            verb: job.verb.clone(),
            params: job.params.clone(),
        })
        .await?;
    let response: Response = channel.recv().await?;
    if response.seq != seq {
        return Err(Error::Protocol(format!(
            "worker answered seq {} to request {seq}",
            response.seq
        )));
    }
    Ok(response.into_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowDouble;

    #[async_trait]
    impl JobHandler for SlowDouble {
        async fn handle(&self, verb: &str, params: Value) -> Result<Value> {
            match verb {
                "double" => {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    let n = params["n"].as_i64().unwrap_or(0);
                    Ok(json!({ "n": n * 2 }))
                }
                "fail" => Err(Error::FileMissing("nothing here".into())),
                _ => Err(Error::Protocol(format!("unknown verb '{verb}'"))),
            }
        }
    }

    #[tokio::test]
    async fn jobs_fan_out_across_workers() {
        let pool = WorkerPool::in_process(Arc::new(SlowDouble), 4, CancellationToken::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..16i64 {
            let run = pool.run("double", json!({ "n": n }));
            handles.push(async move { run.await.unwrap()["n"].as_i64().unwrap() });
        }
        let results = futures::future::join_all(handles).await;
        let expected: Vec<i64> = (0..16).map(|n| n * 2).collect();
        assert_eq!(results, expected);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn job_errors_surface_to_the_submitter() {
        let pool = WorkerPool::in_process(Arc::new(SlowDouble), 2, CancellationToken::new())
            .await
            .unwrap();

        let err = pool.run("fail", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("FileMissingError"));

        // the pool keeps serving after a job-level failure
        let ok = pool.run("double", json!({"n": 21})).await.unwrap();
        assert_eq!(ok["n"], 42);

        pool.shutdown().await;
    }
}
