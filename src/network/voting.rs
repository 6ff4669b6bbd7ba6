//! Pre-consensus polling
//!
//! Peers may poll us for verdicts on inventory items before committing to
//! them. The verdicts come from a pluggable [`crate::interfaces::VoteProcessor`];
//! the engine only enforces message limits and availability gating.

use crate::network::protocol::*;
use crate::network::NetEngine;
use anyhow::Result;
use tracing::debug;

/// Poll misbehavior is scored on its own scale, independent of block and
/// transaction relay penalties.
const OVERSIZED_POLL_PENALTY: u32 = 20;

impl NetEngine {
    pub(crate) async fn handle_poll(&self, id: NodeId, poll: PollMessage) -> Result<()> {
        let Some(processor) = (self.config.enable_voting)
            .then(|| self.vote_processor.as_ref())
            .flatten()
        else {
            debug!("{}: poll received but voting is disabled", id);
            return Ok(());
        };
        if poll.items.len() > MAX_POLL_ELEMENTS {
            self.misbehaving(id, OVERSIZED_POLL_PENALTY, "oversized poll");
            anyhow::bail!("poll size = {}", poll.items.len());
        }
        if self.is_importing() {
            // No reliable verdicts while the chain state is in motion.
            debug!("{}: deferring poll {} during import", id, poll.round);
            return Ok(());
        }
        let votes = poll
            .items
            .iter()
            .map(|item| Vote {
                error: processor.verdict(item),
                item_hash: match item {
                    InvItem::Block(hash) | InvItem::CompactBlock(hash) => hash.0,
                    InvItem::Tx(txid) => txid.0,
                },
            })
            .collect();
        self.send(
            id,
            Message::PollResponse(PollResponseMessage {
                round: poll.round,
                cooldown: 0,
                votes,
            }),
        );
        Ok(())
    }

    pub(crate) async fn handle_poll_response(
        &self,
        id: NodeId,
        response: PollResponseMessage,
    ) -> Result<()> {
        // We never poll peers ourselves; any response is unsolicited.
        debug!(
            "{}: unsolicited poll response for round {} ({} votes)",
            id,
            response.round,
            response.votes.len()
        );
        Ok(())
    }
}
