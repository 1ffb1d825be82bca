//! FIFO request pipelining over one connection.
//!
//! Many logical requests may be in flight concurrently over one physical
//! connection. The protocol carries no request identifiers: the server is
//! required to answer requests in the order received, so correlation is a
//! strict FIFO queue of pending replies. A writer task serializes frame
//! writes and appends to the queue tail; a reader task owns the socket's
//! read half exclusively, assembles each response frame-by-frame and
//! completes the pending reply at the queue head.
//!
//! Synchronous execution is "submit, then await the returned future", the
//! identical path asynchronous callers use.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{Connection, FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::protocol::{Column, ServerMessage, Warning};

/// What response sequence to expect for a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseShape {
    /// A single terminal acknowledgement: `Ok`, `AuthOk` or `Pong`.
    Ack,
    /// Zero or more result sets, each `ResultHeader` + `Row`* + `ResultDone`,
    /// chained while `more_results` is set. Covers row-returning, row-less
    /// and multi-resultset statements uniformly.
    Rows,
}

/// A completed response, routed back to the submitter.
#[derive(Debug)]
pub(crate) enum Reply {
    Ack,
    Pong { timestamp: i64 },
    Result(ResponseData),
}

/// One buffered result set.
#[derive(Debug)]
pub(crate) struct ResultSetData {
    pub columns: Vec<Column>,
    pub rows: VecDeque<Vec<Value>>,
}

/// The fully-assembled payload of a statement execution.
#[derive(Debug, Default)]
pub(crate) struct ResponseData {
    pub result_sets: VecDeque<ResultSetData>,
    pub affected: u64,
    pub generated_ids: Vec<String>,
    pub auto_increment: Option<u64>,
    pub warnings: Vec<Warning>,
}

/// One outstanding request awaiting its response.
struct PendingReply {
    shape: ResponseShape,
    tx: oneshot::Sender<Result<Reply>>,
    data: ResponseData,
    current: Option<ResultSetData>,
}

impl PendingReply {
    fn new(shape: ResponseShape, tx: oneshot::Sender<Result<Reply>>) -> Self {
        Self {
            shape,
            tx,
            data: ResponseData::default(),
            current: None,
        }
    }
}

enum Step {
    /// More frames belong to this reply.
    Continue,
    /// The reply is fully assembled; pop and complete it.
    Complete(Result<Reply>),
    /// The server broke the protocol; the connection is unusable.
    Violation(String),
}

impl PendingReply {
    fn accept(&mut self, msg: ServerMessage) -> Step {
        match (self.shape, msg) {
            (_, ServerMessage::Error { code, message }) => {
                Step::Complete(Err(Error::Server { code, message }))
            }

            (ResponseShape::Ack, ServerMessage::Ok)
            | (ResponseShape::Ack, ServerMessage::AuthOk { .. }) => Step::Complete(Ok(Reply::Ack)),
            (ResponseShape::Ack, ServerMessage::Pong { timestamp }) => {
                Step::Complete(Ok(Reply::Pong { timestamp }))
            }

            (ResponseShape::Rows, ServerMessage::ResultHeader { columns }) => {
                if self.current.is_some() {
                    return Step::Violation("result header inside an open result set".into());
                }
                self.current = Some(ResultSetData {
                    columns,
                    rows: VecDeque::new(),
                });
                Step::Continue
            }
            (ResponseShape::Rows, ServerMessage::Row { values }) => match self.current.as_mut() {
                Some(set) => {
                    set.rows.push_back(values);
                    Step::Continue
                }
                None => Step::Violation("row without a result header".into()),
            },
            (
                ResponseShape::Rows,
                ServerMessage::ResultDone {
                    affected,
                    generated_ids,
                    auto_increment,
                    warnings,
                    more_results,
                },
            ) => {
                if let Some(set) = self.current.take() {
                    self.data.result_sets.push_back(set);
                }
                self.data.affected = affected;
                self.data.generated_ids.extend(generated_ids);
                if auto_increment.is_some() {
                    self.data.auto_increment = auto_increment;
                }
                self.data.warnings.extend(warnings);
                if more_results {
                    Step::Continue
                } else {
                    Step::Complete(Ok(Reply::Result(std::mem::take(&mut self.data))))
                }
            }

            (shape, other) => Step::Violation(format!(
                "unexpected message {:?} for {:?} response",
                other, shape
            )),
        }
    }
}

struct Submit {
    frame: Vec<u8>,
    shape: ResponseShape,
    reply: oneshot::Sender<Result<Reply>>,
}

/// The FIFO correlation queue. Closing and draining happen under the same
/// lock as appending, so a submission can never slip past the terminal
/// drain and hang forever.
#[derive(Default)]
struct QueueState {
    closed: bool,
    items: VecDeque<PendingReply>,
}

type SharedQueue = Arc<Mutex<QueueState>>;

/// Handle to the dispatcher tasks of one session.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    submit_tx: mpsc::Sender<Submit>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    /// Spawn the writer and reader tasks around an established connection.
    pub fn spawn(conn: Connection) -> Self {
        let (reader, writer) = conn.into_split();
        let (submit_tx, submit_rx) = mpsc::channel(128);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending: SharedQueue = Arc::new(Mutex::new(QueueState::default()));

        tokio::spawn(writer_task(
            writer,
            submit_rx,
            Arc::clone(&pending),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(reader_task(reader, pending, shutdown_tx.clone(), shutdown_rx));

        Self {
            submit_tx,
            shutdown_tx,
        }
    }

    /// Enqueue a request. Returns immediately with a future for its reply.
    pub async fn submit(&self, frame: Vec<u8>, shape: ResponseShape) -> Result<ReplyFuture> {
        let (tx, rx) = oneshot::channel();
        self.submit_tx
            .send(Submit {
                frame,
                shape,
                reply: tx,
            })
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(ReplyFuture { rx })
    }

    /// Tear the pipeline down; all outstanding replies fail with
    /// [`Error::SessionClosed`].
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Future for one submitted request's reply.
pub(crate) struct ReplyFuture {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl Future for ReplyFuture {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Close the queue and fail everything in it. Idempotent; later submissions
/// are refused at append time.
fn fail_all(pending: &SharedQueue, err: Error) {
    let drained: Vec<PendingReply> = {
        let mut state = pending.lock();
        state.closed = true;
        state.items.drain(..).collect()
    };
    for entry in drained {
        let _ = entry.tx.send(Err(err.clone()));
    }
}

/// Serializes frame writes and appends pending replies in submission order.
async fn writer_task(
    mut writer: FrameWriter,
    mut submit_rx: mpsc::Receiver<Submit>,
    pending: SharedQueue,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let submit = tokio::select! {
            submit = submit_rx.recv() => match submit {
                Some(s) => s,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        // Queued before the write so the response can never outrun its entry.
        {
            let mut state = pending.lock();
            if state.closed {
                let _ = submit.reply.send(Err(Error::SessionClosed));
                continue;
            }
            state
                .items
                .push_back(PendingReply::new(submit.shape, submit.reply));
        }

        if let Err(e) = writer.write_frame(&submit.frame).await {
            tracing::warn!("write to {} failed: {}", writer.peer(), e);
            fail_all(&pending, e);
            let _ = shutdown_tx.send(true);
            return;
        }
    }
    let _ = shutdown_tx.send(true);
}

/// Sole reader of the socket: demultiplexes responses onto the FIFO queue.
async fn reader_task(
    mut reader: FrameReader,
    pending: SharedQueue,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            msg = reader.read_frame() => msg,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match msg {
            Ok(msg) => {
                if let Err(violation) = route(&pending, msg) {
                    tracing::warn!("protocol violation from {}: {}", reader.peer(), violation);
                    fail_all(
                        &pending,
                        Error::Communications(format!("protocol violation: {}", violation)),
                    );
                    let _ = shutdown_tx.send(true);
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("read from {} ended: {}", reader.peer(), e);
                fail_all(&pending, e);
                let _ = shutdown_tx.send(true);
                return;
            }
        }
    }
    fail_all(&pending, Error::SessionClosed);
}

/// Feed one frame to the pending reply at the head of the queue.
fn route(pending: &SharedQueue, msg: ServerMessage) -> std::result::Result<(), String> {
    let mut state = pending.lock();
    let head = match state.items.front_mut() {
        Some(head) => head,
        None => return Err(format!("message {:?} with no request in flight", msg)),
    };
    match head.accept(msg) {
        Step::Continue => Ok(()),
        Step::Complete(result) => {
            if let Some(entry) = state.items.pop_front() {
                let _ = entry.tx.send(result);
            }
            Ok(())
        }
        Step::Violation(reason) => Err(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_entry() -> (PendingReply, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (PendingReply::new(ResponseShape::Rows, tx), rx)
    }

    #[test]
    fn test_rows_assembly_single_set() {
        let (mut entry, _rx) = rows_entry();
        assert!(matches!(
            entry.accept(ServerMessage::ResultHeader {
                columns: vec![Column::named("doc")]
            }),
            Step::Continue
        ));
        assert!(matches!(
            entry.accept(ServerMessage::Row {
                values: vec![serde_json::json!({"a": 1})]
            }),
            Step::Continue
        ));
        match entry.accept(ServerMessage::done(0)) {
            Step::Complete(Ok(Reply::Result(data))) => {
                assert_eq!(data.result_sets.len(), 1);
                assert_eq!(data.result_sets[0].rows.len(), 1);
            }
            _ => panic!("expected completed result"),
        }
    }

    #[test]
    fn test_rows_assembly_multi_set() {
        let (mut entry, _rx) = rows_entry();
        for more in [true, false] {
            entry.accept(ServerMessage::ResultHeader {
                columns: vec![Column::named("value")],
            });
            entry.accept(ServerMessage::Row {
                values: vec![serde_json::json!(1)],
            });
            let step = entry.accept(ServerMessage::ResultDone {
                affected: 0,
                generated_ids: vec![],
                auto_increment: None,
                warnings: vec![],
                more_results: more,
            });
            if more {
                assert!(matches!(step, Step::Continue));
            } else {
                match step {
                    Step::Complete(Ok(Reply::Result(data))) => {
                        assert_eq!(data.result_sets.len(), 2)
                    }
                    _ => panic!("expected completed result"),
                }
            }
        }
    }

    #[test]
    fn test_row_without_header_is_violation() {
        let (mut entry, _rx) = rows_entry();
        assert!(matches!(
            entry.accept(ServerMessage::Row { values: vec![] }),
            Step::Violation(_)
        ));
    }

    #[test]
    fn test_server_error_completes_with_failure() {
        let (mut entry, _rx) = rows_entry();
        match entry.accept(ServerMessage::error(1100, "unknown collection")) {
            Step::Complete(Err(Error::Server { code, .. })) => assert_eq!(code, 1100),
            _ => panic!("expected server error"),
        }
    }
}
