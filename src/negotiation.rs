//! The offer/answer round. The offerer creates and sets its offer; either
//! side applies what the remote sends, and the answerer's reply is produced
//! here rather than in the session loop, which only forwards it.

use crate::connection::{self, Connection};
use crate::protocol::{SdpType, SessionDescription};

#[allow(unused_imports)]
use log::{debug, error, info, warn};

pub type Error = connection::Error;

/// Outcome of applying a remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Description to send back to the remote peer, if any.
    pub reply: Option<SessionDescription>,
    /// True the first time a remote description lands on this connection.
    pub first_remote: bool,
    /// Buffered candidates that were applied along with the description.
    pub flushed: usize,
}

pub async fn create_offer(
    connection: &mut Connection,
    data_channel: Option<&str>,
) -> Result<SessionDescription, Error> {
    if let Some(label) = data_channel {
        connection.create_data_channel(label).await?;
        debug!("Declared data channel {label:?}");
    }
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    info!("Created local offer");
    Ok(offer)
}

pub async fn apply_remote_description(
    connection: &mut Connection,
    description: SessionDescription,
) -> Result<Applied, Error> {
    let sdp_type = description.sdp_type;
    let applied = connection.set_remote_description(description).await?;
    info!("Applied remote {sdp_type}");
    let reply = match sdp_type {
        SdpType::Offer => {
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            info!("Created local answer");
            Some(answer)
        }
        SdpType::Answer => None,
    };
    Ok(Applied {
        reply,
        first_remote: applied.first,
        flushed: applied.flushed,
    })
}
