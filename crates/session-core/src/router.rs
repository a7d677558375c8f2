//! Maps identities to the stream that should be rendered for them.

use crate::connection::ConnectionManager;
use crate::identity::IdentityKey;
use crate::media::{LocalMediaController, MediaStream};
use crate::membership::SessionMembership;
use serde::Serialize;

/// Where a tile's stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileSource {
    Camera,
    ScreenShare,
    Remote,
    /// No stream yet: still connecting, or joined without devices.
    Placeholder,
}

/// One participant tile.
#[derive(Debug, Clone)]
pub struct RenderTile {
    pub key: IdentityKey,
    pub is_local: bool,
    pub source: TileSource,
    pub stream: Option<MediaStream>,
}

#[derive(Debug, Clone)]
pub struct StreamRouter {
    local: IdentityKey,
}

impl StreamRouter {
    pub fn new(local: IdentityKey) -> Self {
        Self { local }
    }

    /// Stream for an identity: the active local stream for ourselves, the
    /// live connection's remote stream for anyone else.
    pub fn stream_for(
        &self,
        key: &IdentityKey,
        media: &LocalMediaController,
        connections: &ConnectionManager,
    ) -> Option<MediaStream> {
        if key == &self.local {
            media.active_stream().cloned()
        } else {
            connections.remote_stream(key).cloned()
        }
    }

    /// Tiles for the local participant first, then every other member.
    pub fn tiles(
        &self,
        membership: &SessionMembership,
        media: &LocalMediaController,
        connections: &ConnectionManager,
    ) -> Vec<RenderTile> {
        let local_source = if media.is_presenting() {
            TileSource::ScreenShare
        } else if media.camera().is_some() {
            TileSource::Camera
        } else {
            TileSource::Placeholder
        };
        let mut tiles = vec![RenderTile {
            key: self.local.clone(),
            is_local: true,
            source: local_source,
            stream: media.active_stream().cloned(),
        }];

        tiles.extend(membership.others(&self.local).into_iter().map(|key| {
            let stream = connections.remote_stream(&key).cloned();
            RenderTile {
                source: if stream.is_some() {
                    TileSource::Remote
                } else {
                    TileSource::Placeholder
                },
                key,
                is_local: false,
                stream,
            }
        }));
        tiles
    }
}
