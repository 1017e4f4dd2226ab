//! Transaction relay pool.
//!
//! A single consumer task owns the transaction map; everything else talks
//! to it over a bounded channel. Accepted transactions are rebroadcast to
//! every neighbor from a separate task, duplicates are dropped, which also
//! ends relay echoes. A full pool forgets its oldest transaction.

use crate::network::message::{Hash256, Message, Transaction};
use crate::protocols::P2P;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub const DEFAULT_CHANNEL_SIZE: usize = 1024;
pub const MAX_POOL_SIZE: usize = 10_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Transaction already in pool")]
    AlreadyExists,
    #[error("Transaction pool queue is full")]
    QueueFull,
    #[error("Transaction pool is not running")]
    Stopped,
}

enum PoolCommand {
    Add {
        tx: Transaction,
        reply: Option<oneshot::Sender<Result<(), PoolError>>>,
    },
    Len(oneshot::Sender<usize>),
    Contains(Hash256, oneshot::Sender<bool>),
}

pub struct TxPool {
    cmd_tx: mpsc::Sender<PoolCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<PoolCommand>>>,
    max_size: usize,
    stop: CancellationToken,
}

impl TxPool {
    pub fn new(channel_size: usize, max_size: usize) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(channel_size);
        Arc::new(Self {
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            max_size,
            stop: CancellationToken::new(),
        })
    }

    /// Spawn the consumer. A pool runs once; later calls do nothing.
    pub fn start(&self, net: &Arc<dyn P2P>) {
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            debug!("[txpool] already started");
            return;
        };
        let capacity = NonZeroUsize::new(self.max_size).unwrap_or(NonZeroUsize::MIN);
        let consumer = Consumer {
            txs: LruCache::new(capacity),
            net: Arc::downgrade(net),
        };
        tokio::spawn(consumer.run(cmd_rx, self.stop.clone()));
        info!("[txpool] started");
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Queue a transaction without waiting for the verdict.
    pub fn submit(&self, tx: Transaction) -> Result<(), PoolError> {
        if self.stop.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        self.cmd_tx
            .try_send(PoolCommand::Add { tx, reply: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PoolError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PoolError::Stopped,
            })
    }

    pub async fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.request(PoolCommand::Add {
            tx,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| PoolError::Stopped)?
    }

    pub async fn len(&self) -> Result<usize, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.request(PoolCommand::Len(reply)).await?;
        rx.await.map_err(|_| PoolError::Stopped)
    }

    pub async fn contains(&self, hash: Hash256) -> Result<bool, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.request(PoolCommand::Contains(hash, reply)).await?;
        rx.await.map_err(|_| PoolError::Stopped)
    }

    async fn request(&self, cmd: PoolCommand) -> Result<(), PoolError> {
        if self.stop.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        self.cmd_tx.send(cmd).await.map_err(|_| PoolError::Stopped)
    }
}

struct Consumer {
    txs: LruCache<Hash256, Transaction>,
    net: Weak<dyn P2P>,
}

impl Consumer {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PoolCommand>, stop: CancellationToken) {
        loop {
            let cmd = tokio::select! {
                _ = stop.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                PoolCommand::Add { tx, reply } => {
                    let result = self.add(tx);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                PoolCommand::Len(reply) => {
                    let _ = reply.send(self.txs.len());
                }
                PoolCommand::Contains(hash, reply) => {
                    let _ = reply.send(self.txs.contains(&hash));
                }
            }
        }
        info!("[txpool] stopped with {} transactions", self.txs.len());
    }

    fn add(&mut self, tx: Transaction) -> Result<(), PoolError> {
        let hash = tx.hash();
        if self.txs.contains(&hash) {
            trace!("[txpool] duplicate tx {}", hex::encode(hash));
            return Err(PoolError::AlreadyExists);
        }
        if let Some((old, _)) = self.txs.push(hash, tx.clone()) {
            debug!("[txpool] pool full, dropped oldest tx {}", hex::encode(old));
        }
        debug!("[txpool] accepted tx {}", hex::encode(hash));

        if let Some(net) = self.net.upgrade() {
            tokio::spawn(async move { net.broadcast(&Message::Trn(tx)).await });
        }
        Ok(())
    }
}
