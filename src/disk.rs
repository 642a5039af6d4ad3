// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use tokio::sync::{mpsc, oneshot};

use crate::buffer_pool::PoolBuffer;
use crate::error::DiskError;
use crate::peer::InfoHash;

/// Requests served by the embedder's storage actor.
#[derive(Debug)]
pub enum DiskCommand {
    Read {
        info_hash: InfoHash,
        offset: u64,
        buffer: PoolBuffer,
        respond_to: oneshot::Sender<Result<PoolBuffer, DiskError>>,
    },
}

/// Client half of the disk seam. The send pump borrows a pool buffer, asks
/// the storage actor to fill it, and gets the same buffer back on success;
/// on any failure the buffer returns to the pool when the command or reply
/// is dropped.
#[derive(Clone, Debug)]
pub struct DiskClient {
    command_tx: mpsc::Sender<DiskCommand>,
}

impl DiskClient {
    pub fn new(command_tx: mpsc::Sender<DiskCommand>) -> Self {
        DiskClient { command_tx }
    }

    pub async fn read(
        &self,
        info_hash: InfoHash,
        offset: u64,
        buffer: PoolBuffer,
    ) -> Result<PoolBuffer, DiskError> {
        let (respond_to, reply_rx) = oneshot::channel();
        self.command_tx
            .send(DiskCommand::Read { info_hash, offset, buffer, respond_to })
            .await
            .map_err(|_| DiskError::Unavailable)?;
        reply_rx.await.map_err(|_| DiskError::Unavailable)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;

    #[tokio::test]
    async fn read_round_trips_through_the_actor() {
        let (command_tx, mut command_rx) = mpsc::channel(4);
        let client = DiskClient::new(command_tx);

        tokio::spawn(async move {
            while let Some(DiskCommand::Read { mut buffer, respond_to, offset, .. }) =
                command_rx.recv().await
            {
                buffer.fill(offset as u8);
                let _ = respond_to.send(Ok(buffer));
            }
        });

        let pool = BufferPool::new();
        let buffer = pool.get(8);
        let filled = client.read(InfoHash([0u8; 20]), 7, buffer).await.expect("read");
        assert!(filled.iter().all(|&b| b == 7));
        drop(filled);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn dead_actor_reports_unavailable_and_frees_the_buffer() {
        let (command_tx, command_rx) = mpsc::channel(4);
        drop(command_rx);
        let client = DiskClient::new(command_tx);

        let pool = BufferPool::new();
        let result = client.read(InfoHash([0u8; 20]), 0, pool.get(64)).await;
        assert!(matches!(result, Err(DiskError::Unavailable)));
        assert_eq!(pool.outstanding(), 0);
    }
}
