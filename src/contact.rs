//! Links, contacts, and the manager that owns them.
//!
//! The manager owns every [`Link`] and [`Contact`] by id. Connections hold
//! ids, never references, and resolve them on use, so there are no cycles
//! between a contact, its link, and the connection servicing it.

use crate::bundle::EndpointId;
use crate::link::{LinkParams, LinkType};
use crate::FxDashMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContactId(pub u32);

/// Persistent configuration describing how to reach a peer.
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub typ: LinkType,
    /// The peer's endpoint id, once learned from its announce bundle.
    pub remote_eid: Option<EndpointId>,
    pub params: LinkParams,
    /// Set when segment acks are enabled on the link.
    pub reliable: bool,
}

/// A time-bounded communication opportunity with a specific peer over a
/// specific link.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: ContactId,
    pub link: LinkId,
    pub peer_eid: EndpointId,
}

/// Owns links and contacts, keyed by id.
#[derive(Debug, Default)]
pub struct ContactManager {
    links: FxDashMap<LinkId, Link>,
    contacts: FxDashMap<ContactId, Contact>,
    next_link: AtomicU32,
    next_contact: AtomicU32,
}

impl ContactManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link and returns its id.
    pub fn add_link(&self, typ: LinkType, params: LinkParams) -> LinkId {
        let id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let reliable = params.segment_ack_enabled;
        self.links.insert(
            id,
            Link {
                id,
                typ,
                remote_eid: None,
                params,
                reliable,
            },
        );
        id
    }

    pub fn link(&self, id: LinkId) -> Option<Link> {
        self.links.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contact(&self, id: ContactId) -> Option<Contact> {
        self.contacts.get(&id).map(|entry| entry.value().clone())
    }

    /// Finds the contact for `link` or establishes one for the peer named
    /// in its announce bundle, recording the peer's endpoint id on the
    /// link.
    pub fn ensure_contact(&self, link: LinkId, peer_eid: &EndpointId) -> ContactId {
        if let Some(existing) = self
            .contacts
            .iter()
            .find(|entry| entry.link == link)
            .map(|entry| entry.id)
        {
            return existing;
        }
        if let Some(mut entry) = self.links.get_mut(&link) {
            entry.remote_eid = Some(peer_eid.clone());
        }
        let id = ContactId(self.next_contact.fetch_add(1, Ordering::Relaxed));
        self.contacts.insert(
            id,
            Contact {
                id,
                link,
                peer_eid: peer_eid.clone(),
            },
        );
        id
    }

    /// Removes the contact when it closes; the link stays registered.
    pub fn remove_contact(&self, id: ContactId) {
        self.contacts.remove(&id);
    }
}
