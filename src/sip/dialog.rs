/// Dialog state keyed by Call-ID.
///
/// A dialog tracks our tag, the peer's tag, per-method CSeq counters and
/// the last message seen, which the BYE/ACK builders work from.

use std::collections::HashMap;

use crate::sip::message::{SipMessage, SipMethod};

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub remote_contact: Option<String>,
    cseq: HashMap<SipMethod, u32>,
    pub last_message: Option<SipMessage>,
}

impl Dialog {
    pub fn new(call_id: &str, local_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: None,
            remote_contact: None,
            cseq: HashMap::new(),
            last_message: None,
        }
    }

    /// Advance and return the CSeq for a method within this dialog.
    pub fn next_cseq(&mut self, method: SipMethod) -> u32 {
        let entry = self.cseq.entry(method).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Fold a message into the dialog: remote tag, remote contact and the
    /// last-seen image.
    pub fn absorb(&mut self, message: &SipMessage) {
        let remote = if message.is_request() {
            message.from_header()
        } else {
            message.to_header()
        };
        if let Some(tag) = remote.and_then(|a| a.tag.clone()) {
            self.remote_tag = Some(tag);
        }
        if let Some(contact) = message.contact() {
            self.remote_contact = Some(contact.uri.clone());
        }
        self.last_message = Some(message.clone());
    }
}

#[derive(Debug, Default)]
pub struct DialogTable {
    dialogs: HashMap<String, Dialog>,
}

impl DialogTable {
    pub fn insert(&mut self, dialog: Dialog) {
        self.dialogs.insert(dialog.call_id.clone(), dialog);
    }

    pub fn get(&self, call_id: &str) -> Option<&Dialog> {
        self.dialogs.get(call_id)
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut Dialog> {
        self.dialogs.get_mut(call_id)
    }

    pub fn remove(&mut self, call_id: &str) -> Option<Dialog> {
        self.dialogs.remove(call_id)
    }

    pub fn local_tag(&self, call_id: &str) -> Option<&str> {
        self.dialogs.get(call_id).map(|d| d.local_tag.as_str())
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}
