//! Compact filter service
//!
//! Serves getcfilters, getcfheaders, and getcfcheckpt from a filter index
//! maintained elsewhere. Requests are validated strictly; anything
//! malformed or out of range disconnects the requester, since honest
//! clients never produce such requests.

use crate::network::protocol::*;
use crate::network::NetEngine;
use anyhow::Result;
use tracing::debug;

/// Spacing of filter header checkpoints.
const CFCHECKPT_INTERVAL: u32 = 1_000;

impl NetEngine {
    /// Validate a filter request and resolve it to a height range on the
    /// active chain. `None` means the request was rejected and the peer
    /// disconnected.
    fn filter_request_range(
        &self,
        id: NodeId,
        filter_type: u8,
        start_height: u32,
        stop_hash: &BlockHash,
        max_range: u32,
    ) -> Option<(u32, u32)> {
        if !self.config.serve_compact_filters || self.filter_index.is_none() {
            debug!("{}: filter request but service is disabled", id);
            self.transport.disconnect(id);
            return None;
        }
        if filter_type != FILTER_TYPE_BASIC {
            debug!("{}: filter request for unknown type {}", id, filter_type);
            self.transport.disconnect(id);
            return None;
        }
        let chain = self.chain.read().unwrap();
        let stop_height = match chain.lookup(stop_hash) {
            Some(key) if chain.is_active(key) => chain.get(key).height,
            _ => {
                debug!("{}: filter request for unknown block {:?}", id, stop_hash);
                drop(chain);
                self.transport.disconnect(id);
                return None;
            }
        };
        drop(chain);
        if start_height > stop_height {
            debug!(
                "{}: filter request with start {} past stop {}",
                id, start_height, stop_height
            );
            self.transport.disconnect(id);
            return None;
        }
        if stop_height - start_height + 1 > max_range {
            debug!(
                "{}: filter request spanning {} blocks (max {})",
                id,
                stop_height - start_height + 1,
                max_range
            );
            self.transport.disconnect(id);
            return None;
        }
        Some((start_height, stop_height))
    }

    fn active_hash(&self, height: u32) -> Option<BlockHash> {
        let chain = self.chain.read().unwrap();
        chain.active_at(height).map(|key| chain.get(key).hash)
    }

    pub(crate) async fn handle_getcfilters(
        &self,
        id: NodeId,
        filter_type: u8,
        start_height: u32,
        stop_hash: BlockHash,
    ) -> Result<()> {
        let Some((start, stop)) =
            self.filter_request_range(id, filter_type, start_height, &stop_hash, MAX_GETCFILTERS_SIZE)
        else {
            return Ok(());
        };
        let index = self.filter_index.as_ref().unwrap();
        for height in start..=stop {
            let Some(hash) = self.active_hash(height) else {
                break;
            };
            let Some(filter) = index.filter(height, &hash) else {
                // Index still catching up; serve what exists.
                break;
            };
            self.send(
                id,
                Message::Cfilter {
                    filter_type,
                    block_hash: hash,
                    filter,
                },
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_getcfheaders(
        &self,
        id: NodeId,
        filter_type: u8,
        start_height: u32,
        stop_hash: BlockHash,
    ) -> Result<()> {
        let Some((start, stop)) = self.filter_request_range(
            id,
            filter_type,
            start_height,
            &stop_hash,
            MAX_GETCFHEADERS_SIZE,
        ) else {
            return Ok(());
        };
        let index = self.filter_index.as_ref().unwrap();
        let prev_header = if start > 0 {
            let Some(hash) = self.active_hash(start - 1) else {
                return Ok(());
            };
            match index.filter_header(start - 1, &hash) {
                Some(header) => header,
                None => return Ok(()),
            }
        } else {
            BlockHash::default()
        };
        let mut headers = Vec::with_capacity((stop - start + 1) as usize);
        for height in start..=stop {
            let Some(hash) = self.active_hash(height) else {
                return Ok(());
            };
            match index.filter_header(height, &hash) {
                Some(header) => headers.push(header),
                None => return Ok(()),
            }
        }
        self.send(
            id,
            Message::Cfheaders {
                filter_type,
                stop_hash,
                prev_header,
                headers,
            },
        );
        Ok(())
    }

    pub(crate) async fn handle_getcfcheckpt(
        &self,
        id: NodeId,
        filter_type: u8,
        stop_hash: BlockHash,
    ) -> Result<()> {
        // Checkpoints span the whole chain; the range cap does not apply.
        let Some((_, stop)) =
            self.filter_request_range(id, filter_type, 0, &stop_hash, u32::MAX)
        else {
            return Ok(());
        };
        let index = self.filter_index.as_ref().unwrap();
        let mut headers = Vec::new();
        let mut height = CFCHECKPT_INTERVAL;
        while height <= stop {
            let Some(hash) = self.active_hash(height) else {
                break;
            };
            match index.filter_header(height, &hash) {
                Some(header) => headers.push(header),
                None => break,
            }
            height += CFCHECKPT_INTERVAL;
        }
        self.send(
            id,
            Message::Cfcheckpt {
                filter_type,
                stop_hash,
                headers,
            },
        );
        Ok(())
    }
}
