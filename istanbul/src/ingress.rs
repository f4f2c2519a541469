use crate::{types::Code, Digest, Error, Proposal};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use tracing::debug;

/// Messages sent to the [Engine](crate::Engine).
pub enum Message<P: Proposal> {
    /// A proposal the local validator should propose when it is the proposer.
    Request(P),
    /// A consensus message received from the network.
    Message { code: Code, payload: Bytes },
    /// The backend finalized a proposal.
    FinalCommitted,
    /// Whether the local validator proposes in the current round.
    IsProposer { response: oneshot::Sender<bool> },
    /// Whether `digest` is the proposal the local validator is trying to finalize.
    IsCurrentProposal {
        digest: Digest,
        response: oneshot::Sender<bool>,
    },
    /// Stop the engine.
    Stop,
}

/// Handle used by the host (and its network layer) to drive the [Engine](crate::Engine).
///
/// Once the engine has stopped, events are dropped and queries answer `false`.
#[derive(Clone)]
pub struct Mailbox<P: Proposal> {
    sender: mpsc::Sender<Message<P>>,
}

impl<P: Proposal> Mailbox<P> {
    pub(crate) fn new(sender: mpsc::Sender<Message<P>>) -> Self {
        Self { sender }
    }

    async fn send(&mut self, message: Message<P>) {
        if self.sender.send(message).await.is_err() {
            debug!("engine stopped, dropping event");
        }
    }

    /// Ask the engine to propose `proposal`.
    pub async fn request(&mut self, proposal: P) {
        self.send(Message::Request(proposal)).await;
    }

    /// Deliver a message received from the network.
    ///
    /// Returns [Error::UnknownCode] (without contacting the engine) if `code` does not
    /// name a consensus message.
    pub async fn message(&mut self, code: u8, payload: Bytes) -> Result<(), Error> {
        let code = Code::try_from(code)?;
        self.send(Message::Message { code, payload }).await;
        Ok(())
    }

    /// Notify the engine that the backend finalized a proposal.
    pub async fn final_committed(&mut self) {
        self.send(Message::FinalCommitted).await;
    }

    pub async fn is_proposer(&mut self) -> bool {
        let (response, receiver) = oneshot::channel();
        self.send(Message::IsProposer { response }).await;
        receiver.await.unwrap_or(false)
    }

    pub async fn is_current_proposal(&mut self, digest: Digest) -> bool {
        let (response, receiver) = oneshot::channel();
        self.send(Message::IsCurrentProposal { digest, response })
            .await;
        receiver.await.unwrap_or(false)
    }

    /// Stop the engine after the events queued before this call are processed.
    pub async fn stop(&mut self) {
        self.send(Message::Stop).await;
    }
}
