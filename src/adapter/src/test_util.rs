// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test support: an in-process [`Socket`] over channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::Socket;

/// One end of an in-process socket pair.
#[derive(Debug)]
pub struct ChannelSocket {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

/// Creates a connected socket pair.
pub fn socket_pair() -> (ChannelSocket, ChannelSocket) {
    let (a_tx, a_rx) = mpsc::channel(1024);
    let (b_tx, b_rx) = mpsc::channel(1024);
    (
        ChannelSocket { tx: a_tx, rx: b_rx },
        ChannelSocket { tx: b_tx, rx: a_rx },
    )
}

impl ChannelSocket {
    /// Closes this end.
    pub fn close(self) {}
}

#[async_trait]
impl Socket for ChannelSocket {
    async fn send(&mut self, frame: String) -> Result<(), std::io::Error> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))
    }

    async fn recv(&mut self) -> Option<Result<String, std::io::Error>> {
        self.rx.recv().await.map(Ok)
    }
}
