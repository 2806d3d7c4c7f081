//! DKG share redistribution.
//!
//! Kicking a member and minting a public invite link both start a fresh
//! triple-ratchet session for the owner and hand every remaining peer a
//! template for its slot. Peers are renumbered from 2 (the owner keeps
//! slot 1); shares nobody claims become spare invite payloads.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use super::provider::{CryptoProvider, SpaceSession};
use super::ratchet_state::{DkgRatchet, TripleRatchet};
use crate::error::{QuorumError, Result};

const OWNER_SLOT: u64 = 1;
const FIRST_PEER_SLOT: u64 = 2;

/// A member that should keep access, with the base64 inbox key of the
/// device the old ratchet knows about, if any.
#[derive(Debug, Clone)]
pub struct RemainingMember {
    pub user_address: String,
    pub inbox_address: String,
    pub peer_key: Option<String>,
}

/// Rekey template destined for one remaining member.
#[derive(Debug, Clone)]
pub struct PeerRekey {
    pub user_address: String,
    pub inbox_address: String,
    /// Base64 X448 key the template is sealed to.
    pub peer_public_key: String,
    pub template: TripleRatchet,
}

/// Unclaimed share, packaged later as a single-use public invite.
#[derive(Debug, Clone)]
pub struct SpareShare {
    pub id: u64,
    pub template: TripleRatchet,
    pub secret_hex: String,
}

#[derive(Debug, Clone)]
pub struct Redistribution {
    /// Owner session with the renumbered peer maps and no evals left.
    pub session: SpaceSession,
    pub rekeys: Vec<PeerRekey>,
    pub spares: Vec<SpareShare>,
}

/// Renumber `members` into `session` and cut templates for each slot.
///
/// `previous` is the ratchet the space used until now; only members whose
/// device key appears in its peer map get a slot. `session` must come from
/// a fresh establish call sized for the members plus spares.
pub fn redistribute(
    crypto: &dyn CryptoProvider,
    previous: &TripleRatchet,
    mut session: SpaceSession,
    members: &[RemainingMember],
) -> Result<Redistribution> {
    let owner = previous
        .peer(OWNER_SLOT)
        .cloned()
        .ok_or_else(|| QuorumError::Crypto("ratchet has no owner slot".into()))?;
    let base = session
        .template
        .take()
        .ok_or_else(|| QuorumError::Crypto("session has no template".into()))?;

    let mut own = session.ratchet()?;
    own.id_peer_map.clear();
    own.peer_id_map.clear();
    own.insert_peer(OWNER_SLOT, owner);

    // Slots are handed out in member order; a member without a known
    // device still burns its number.
    let mut slots: Vec<(u64, &RemainingMember)> = Vec::new();
    let mut next_slot = FIRST_PEER_SLOT;
    for member in members {
        let known = member.peer_key.as_ref().and_then(|key| {
            previous
                .peer_id_map
                .get(key)
                .and_then(|old_id| previous.peer(*old_id))
                .cloned()
        });
        if let Some(entry) = known {
            own.insert_peer(next_slot, entry);
            slots.push((next_slot, member));
        }
        next_slot += 1;
    }
    session.state = own.to_json()?;

    let total = own.peer_id_map.len() as u64;
    let evals = std::mem::take(&mut session.evals);
    let share = |id: u64| -> Option<&Vec<u8>> { evals.get((id - FIRST_PEER_SLOT) as usize) };

    let mut rekeys = Vec::with_capacity(slots.len());
    for (id, member) in slots {
        let eval = share(id).ok_or_else(|| {
            QuorumError::Crypto(format!("no eval share left for peer slot {}", id))
        })?;
        let peer_public_key = own
            .peer(id)
            .map(|p| p.public_key.clone())
            .unwrap_or_default();
        rekeys.push(PeerRekey {
            user_address: member.user_address.clone(),
            inbox_address: member.inbox_address.clone(),
            peer_public_key,
            template: slot_template(crypto, &base, &own, id, total, eval)?,
        });
    }

    let mut spares = Vec::new();
    let first_spare = next_slot;
    for (offset, eval) in evals
        .iter()
        .skip((first_spare - FIRST_PEER_SLOT) as usize)
        .enumerate()
    {
        let id = first_spare + offset as u64;
        spares.push(SpareShare {
            id,
            template: slot_template(crypto, &base, &own, id, total, eval)?,
            secret_hex: hex::encode(eval),
        });
    }

    log::debug!(
        "Redistributed DKG shares: {} rekeys, {} spares",
        rekeys.len(),
        spares.len()
    );
    Ok(Redistribution {
        session,
        rekeys,
        spares,
    })
}

/// Template for peer slot `id` built around the raw share `eval`.
pub fn slot_template(
    crypto: &dyn CryptoProvider,
    base: &TripleRatchet,
    own: &TripleRatchet,
    id: u64,
    total: u64,
    eval: &[u8],
) -> Result<TripleRatchet> {
    let mut template = base.clone();
    template.id_peer_map = own.id_peer_map.clone();
    template.peer_id_map = own.peer_id_map.clone();
    template.root_key = own.root_key.clone();

    let mut dkg = template.dkg()?;
    dkg.id = id;
    dkg.total = total;
    fill_share(crypto, &mut dkg, eval)?;
    template.set_dkg(&dkg)?;

    let ephemeral = crypto.generate_x448()?;
    template.ephemeral_private_key = Some(B64.encode(&ephemeral.private_key));
    Ok(template)
}

/// Install a fresh secret plus the scalar/point pair derived from `eval`.
pub fn fill_share(crypto: &dyn CryptoProvider, dkg: &mut DkgRatchet, eval: &[u8]) -> Result<()> {
    let secret = crypto.generate_x448()?;
    let point = B64.encode(crypto.get_pubkey_x448(eval)?);
    dkg.secret = B64.encode(&secret.private_key);
    dkg.scalar = B64.encode(eval);
    dkg.point = serde_json::Value::String(point.clone());
    dkg.random_commitment_point = serde_json::Value::String(point);
    Ok(())
}
