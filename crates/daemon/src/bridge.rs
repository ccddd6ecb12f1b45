// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bidirectional TCP↔WebSocket byte pump used for the monitor console,
//! UART analyzer, and debug-server routes (§4.C, §6).
//!
//! Each direction is two tasks connected by an unbounded channel: a reader
//! that waits on [`Watermark`] before pulling more bytes, and a writer that
//! drains the channel and releases watermark credit as it flushes. This
//! decouples the two sides' I/O without letting a slow consumer buffer an
//! unbounded amount of data in memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::env;

const READ_CHUNK: usize = 4096;

struct Watermark {
    inflight: AtomicUsize,
    high: usize,
    low: usize,
    notify: Notify,
}

impl Watermark {
    fn new(high: usize, low: usize) -> Arc<Self> {
        Arc::new(Self { inflight: AtomicUsize::new(0), high, low, notify: Notify::new() })
    }

    async fn wait_for_room(&self) {
        while self.inflight.load(Ordering::Acquire) >= self.high {
            self.notify.notified().await;
        }
    }

    fn add(&self, n: usize) {
        self.inflight.fetch_add(n, Ordering::AcqRel);
    }

    fn remove(&self, n: usize) {
        let prev = self.inflight.fetch_sub(n, Ordering::AcqRel);
        if prev.saturating_sub(n) <= self.low {
            self.notify.notify_waiters();
        }
    }
}

/// Pump bytes between `tcp` and `ws` until either side closes, coordinating
/// a half-close: EOF on one side stops that direction but lets the other
/// keep draining until it, too, reaches EOF or Close.
pub async fn run(tcp: TcpStream, ws: WebSocket) {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut ws_write, mut ws_read) = ws.split();

    let high = env::bridge_high_water_mark();
    let low = env::bridge_low_water_mark();
    let outbound = Watermark::new(high, low);
    let inbound = Watermark::new(high, low);

    let (tcp_to_ws_tx, mut tcp_to_ws_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (ws_to_tcp_tx, mut ws_to_tcp_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader_wm = outbound.clone();
    let tcp_reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            reader_wm.wait_for_room().await;
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    reader_wm.add(n);
                    if tcp_to_ws_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let missed_pongs = Arc::new(AtomicUsize::new(0));

    let writer_wm = outbound.clone();
    let pong_tracker = missed_pongs.clone();
    let ws_writer = tokio::spawn(async move {
        let mut ping_tick = tokio::time::interval(env::bridge_ping_interval());
        ping_tick.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                chunk = tcp_to_ws_rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            let len = chunk.len();
                            if ws_write.send(Message::Binary(chunk)).await.is_err() {
                                break;
                            }
                            writer_wm.remove(len);
                        }
                        None => break,
                    }
                }
                _ = ping_tick.tick() => {
                    if pong_tracker.fetch_add(1, Ordering::AcqRel) + 1 > env::bridge_missed_pong_limit() as usize {
                        break;
                    }
                    if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_write.send(Message::Close(None)).await;
    });

    let reader_wm = inbound.clone();
    let pong_tracker = missed_pongs.clone();
    let ws_reader = tokio::spawn(async move {
        loop {
            let data = match ws_read.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Pong(_))) => {
                    pong_tracker.store(0, Ordering::Release);
                    continue;
                }
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
            };
            if data.is_empty() {
                continue;
            }
            reader_wm.wait_for_room().await;
            let len = data.len();
            reader_wm.add(len);
            if ws_to_tcp_tx.send(data).is_err() {
                break;
            }
        }
    });

    let writer_wm = inbound.clone();
    let tcp_writer = tokio::spawn(async move {
        while let Some(chunk) = ws_to_tcp_rx.recv().await {
            let len = chunk.len();
            if tcp_write.write_all(&chunk).await.is_err() {
                break;
            }
            writer_wm.remove(len);
        }
        let _ = tcp_write.shutdown().await;
    });

    let _ = tokio::join!(tcp_reader, ws_writer, ws_reader, tcp_writer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watermark_blocks_past_high_and_resumes_at_low() {
        let wm = Watermark::new(100, 20);
        wm.add(100);

        let wm2 = wm.clone();
        let waiter = tokio::spawn(async move {
            wm2.wait_for_room().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wm.remove(50); // still above low (50 > 20), should not release
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wm.remove(40); // now at 10, below low(20): releases
        waiter.await.expect("waiter completes once under low watermark");
    }
}
