use facelens_core::{
    AnalysisResult, Attribute, DetectOptions, EmbeddingModel, FaceError, FacePipeline, Image, Representation,
    VerificationResult, VerifyOptions,
};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the engine workers.
enum EngineRequest {
    Verify {
        a: Image,
        b: Image,
        options: VerifyOptions,
        reply: oneshot::Sender<Result<VerificationResult, EngineError>>,
    },
    Analyze {
        image: Image,
        attributes: Vec<Attribute>,
        options: DetectOptions,
        reply: oneshot::Sender<Result<Vec<AnalysisResult>, EngineError>>,
    },
    Represent {
        image: Image,
        model: EmbeddingModel,
        options: DetectOptions,
        reply: oneshot::Sender<Result<Vec<Representation>, EngineError>>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn verify(&self, a: Image, b: Image, options: VerifyOptions) -> Result<VerificationResult, EngineError> {
        self.call(|reply| EngineRequest::Verify { a, b, options, reply })
            .await
    }

    pub async fn analyze(
        &self,
        image: Image,
        attributes: Vec<Attribute>,
        options: DetectOptions,
    ) -> Result<Vec<AnalysisResult>, EngineError> {
        self.call(|reply| EngineRequest::Analyze {
            image,
            attributes,
            options,
            reply,
        })
        .await
    }

    pub async fn represent(
        &self,
        image: Image,
        model: EmbeddingModel,
        options: DetectOptions,
    ) -> Result<Vec<Representation>, EngineError> {
        self.call(|reply| EngineRequest::Represent {
            image,
            model,
            options,
            reply,
        })
        .await
    }
}

/// Spawn `workers` OS threads serving pipeline requests.
///
/// Workers pull from one shared queue; each request runs to completion on a
/// single thread. The workers exit once every handle is dropped.
pub fn spawn_engine(pipeline: Arc<FacePipeline>, workers: usize) -> Result<EngineHandle, EngineError> {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * 2);
    let rx = Arc::new(Mutex::new(rx));

    for id in 0..workers {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        std::thread::Builder::new()
            .name(format!("facelens-engine-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "engine worker started");
                loop {
                    let req = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
                    let Some(req) = req else { break };
                    handle(&pipeline, req);
                }
                tracing::debug!(worker = id, "engine worker exiting");
            })?;
    }
    tracing::info!(workers, "engine started");

    Ok(EngineHandle { tx })
}

fn handle(pipeline: &FacePipeline, req: EngineRequest) {
    match req {
        EngineRequest::Verify { a, b, options, reply } => {
            let _ = reply.send(pipeline.verify(&a, &b, &options).map_err(Into::into));
        }
        EngineRequest::Analyze {
            image,
            attributes,
            options,
            reply,
        } => {
            let _ = reply.send(pipeline.analyze(&image, &attributes, &options).map_err(Into::into));
        }
        EngineRequest::Represent {
            image,
            model,
            options,
            reply,
        } => {
            let _ = reply.send(pipeline.represent_image(&image, model, &options).map_err(Into::into));
        }
    }
}
