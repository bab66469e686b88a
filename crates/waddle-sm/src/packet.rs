//! Stanza packets and the results queue.
//!
//! A [`Packet`] wraps a parsed `minidom` element together with the routing
//! metadata the pipeline needs: internal `packet_from`/`packet_to` addresses
//! set by the transport, the application-level `stanza_from`/`stanza_to`
//! JIDs, a delivery priority and the set of processors that already handled
//! the packet.

use std::collections::{vec_deque, BTreeSet, VecDeque};
use std::fmt;

use jid::Jid;
use minidom::{Element, Node};

use crate::error::{SmError, StanzaErrorCondition};

/// Namespace URIs used by the pipeline and its processors.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// SASL2 namespace (XEP-0388)
    pub const SASL2: &str = "urn:xmpp:sasl:2";
    /// Stream compression namespace (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Bind2 namespace (XEP-0386)
    pub const BIND2: &str = "urn:xmpp:bind:0";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Non-SASL authentication (XEP-0078)
    pub const IQ_AUTH: &str = "jabber:iq:auth";
    /// Non-SASL authentication stream feature
    pub const IQ_AUTH_FEATURE: &str = "http://jabber.org/features/iq-auth";
    /// In-band registration (XEP-0077)
    pub const IQ_REGISTER: &str = "jabber:iq:register";
    /// In-band registration stream feature
    pub const IQ_REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    /// Client State Indication (XEP-0352)
    pub const CSI: &str = "urn:xmpp:csi:0";
    /// Message Carbons (XEP-0280)
    pub const CARBONS: &str = "urn:xmpp:carbons:2";
    /// Service Discovery info (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Entity Capabilities (XEP-0115)
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    /// Last Activity (XEP-0012)
    pub const LAST: &str = "jabber:iq:last";
    /// Ad-hoc commands, used for transport directives
    pub const COMMANDS: &str = "http://jabber.org/protocol/commands";
    /// Internal delivery-error payload, stripped before leaving the server
    pub const DELIVERY_ERROR: &str = "urn:xmpp:waddle:delivery-error:0";
}

/// Delivery priority of a packet.
///
/// Lower variants are delivered first by [`Results::into_prioritized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Control traffic that must precede everything else
    System,
    /// Urgent stanzas
    High,
    /// Regular traffic
    #[default]
    Normal,
    /// Presence broadcasts
    Presence,
    /// Bulk traffic
    Low,
}

impl Priority {
    fn for_element(name: &str) -> Self {
        match name {
            "presence" => Priority::Presence,
            _ => Priority::Normal,
        }
    }
}

/// Stanza `type` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    /// iq get
    Get,
    /// iq set
    Set,
    /// iq result
    Result,
    /// any error stanza
    Error,
    /// presence available (no type attribute)
    Available,
    /// presence unavailable
    Unavailable,
    /// presence subscribe
    Subscribe,
    /// presence subscribed
    Subscribed,
    /// presence unsubscribe
    Unsubscribe,
    /// presence unsubscribed
    Unsubscribed,
    /// presence probe
    Probe,
    /// message chat
    Chat,
    /// message groupchat
    Groupchat,
    /// message headline
    Headline,
    /// message normal
    Normal,
}

impl StanzaType {
    /// Parse a `type` attribute value.
    pub fn parse(value: &str) -> Option<Self> {
        let ty = match value {
            "get" => Self::Get,
            "set" => Self::Set,
            "result" => Self::Result,
            "error" => Self::Error,
            "available" => Self::Available,
            "unavailable" => Self::Unavailable,
            "subscribe" => Self::Subscribe,
            "subscribed" => Self::Subscribed,
            "unsubscribe" => Self::Unsubscribe,
            "unsubscribed" => Self::Unsubscribed,
            "probe" => Self::Probe,
            "chat" => Self::Chat,
            "groupchat" => Self::Groupchat,
            "headline" => Self::Headline,
            "normal" => Self::Normal,
            _ => return None,
        };
        Some(ty)
    }

    /// Get the attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::Subscribe => "subscribe",
            Self::Subscribed => "subscribed",
            Self::Unsubscribe => "unsubscribe",
            Self::Unsubscribed => "unsubscribed",
            Self::Probe => "probe",
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Headline => "headline",
            Self::Normal => "normal",
        }
    }

    /// Presence subscription management types.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Subscribed | Self::Unsubscribe | Self::Unsubscribed
        )
    }
}

impl fmt::Display for StanzaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directives for the transport layer carried alongside stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Close the client stream
    StreamClose,
}

impl Command {
    /// Command node name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamClose => "STREAM_CLOSE",
        }
    }
}

/// A stanza travelling through the session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    element: Element,
    packet_from: Option<Jid>,
    packet_to: Option<Jid>,
    stanza_from: Option<Jid>,
    stanza_to: Option<Jid>,
    authorised_from: Option<Jid>,
    priority: Priority,
    processed_by: BTreeSet<String>,
    command: Option<Command>,
}

impl Packet {
    /// Wrap an element, reading `from`/`to` as the stanza addresses.
    pub fn new(element: Element) -> Result<Self, SmError> {
        let stanza_from = jid_attr(&element, "from")?;
        let stanza_to = jid_attr(&element, "to")?;
        let priority = Priority::for_element(element.name());
        Ok(Self {
            element,
            packet_from: None,
            packet_to: None,
            stanza_from,
            stanza_to,
            authorised_from: None,
            priority,
            processed_by: BTreeSet::new(),
            command: None,
        })
    }

    /// Wrap an element received on the given client connection.
    pub fn from_connection(element: Element, connection_id: &Jid) -> Result<Self, SmError> {
        Ok(Self::new(element)?.with_packet_from(connection_id.clone()))
    }

    /// Build a stream-close directive addressed to a client connection.
    pub fn close_command(connection_id: &Jid) -> Self {
        let element = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .append(
                Element::builder("command", ns::COMMANDS)
                    .attr("node", Command::StreamClose.as_str())
                    .build(),
            )
            .build();
        Self {
            element,
            packet_from: None,
            packet_to: Some(connection_id.clone()),
            stanza_from: None,
            stanza_to: None,
            authorised_from: None,
            priority: Priority::Normal,
            processed_by: BTreeSet::new(),
            command: Some(Command::StreamClose),
        }
    }

    /// Set the internal source address.
    pub fn with_packet_from(mut self, from: Jid) -> Self {
        self.packet_from = Some(from);
        self
    }

    /// Set the internal destination address.
    pub fn with_packet_to(mut self, to: Jid) -> Self {
        self.packet_to = Some(to);
        self
    }

    /// Attach a sender address already verified by the server.
    pub fn with_authorised_from(mut self, from: Jid) -> Self {
        self.authorised_from = Some(from);
        self
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Mutable access for filters that rewrite outbound payloads.
    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    /// Top-level element name (`iq`, `message`, `presence`, ...).
    pub fn elem_name(&self) -> &str {
        self.element.name()
    }

    /// Namespace of the top-level element.
    pub fn xmlns(&self) -> String {
        self.element.ns()
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Raw `type` attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// Parsed stanza type; presence without a type is `Available`.
    pub fn stanza_type(&self) -> Option<StanzaType> {
        match self.type_attr() {
            Some(value) => StanzaType::parse(value),
            None if self.elem_name() == "presence" => Some(StanzaType::Available),
            None => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.type_attr() == Some("error")
    }

    pub fn packet_from(&self) -> Option<&Jid> {
        self.packet_from.as_ref()
    }

    pub fn packet_to(&self) -> Option<&Jid> {
        self.packet_to.as_ref()
    }

    pub fn set_packet_from(&mut self, from: Option<Jid>) {
        self.packet_from = from;
    }

    pub fn set_packet_to(&mut self, to: Option<Jid>) {
        self.packet_to = to;
    }

    pub fn stanza_from(&self) -> Option<&Jid> {
        self.stanza_from.as_ref()
    }

    pub fn stanza_to(&self) -> Option<&Jid> {
        self.stanza_to.as_ref()
    }

    /// Sender address stamped by a trusted component, if any.
    pub fn authorised_from(&self) -> Option<&Jid> {
        self.authorised_from.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn command(&self) -> Option<Command> {
        self.command
    }

    /// Rewrite the stanza addresses, keeping the element attributes in sync.
    ///
    /// This is the only sanctioned way for pipeline stages to change
    /// addressing once a packet exists.
    pub fn init_vars(&mut self, from: Option<Jid>, to: Option<Jid>) {
        self.element
            .set_attr("from", from.as_ref().map(|jid| jid.to_string()));
        self.element.set_attr("to", to.as_ref().map(|jid| jid.to_string()));
        self.stanza_from = from;
        self.stanza_to = to;
    }

    /// Mark the packet as handled by a processor.
    pub fn processed(&mut self, processor_id: &str) {
        self.processed_by.insert(processor_id.to_string());
    }

    pub fn was_processed_by(&self, processor_id: &str) -> bool {
        self.processed_by.contains(processor_id)
    }

    pub fn processed_by(&self) -> impl Iterator<Item = &str> {
        self.processed_by.iter().map(String::as_str)
    }

    /// Find the element at a name path starting with the root name.
    ///
    /// `["iq", "query"]` returns the first `query` child of an `iq` root,
    /// whatever its namespace.
    pub fn element_at_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Element> {
        let (first, rest) = path.split_first()?;
        if self.element.name() != first.as_ref() {
            return None;
        }
        let mut current = &self.element;
        for name in rest {
            current = current.children().find(|c| c.name() == name.as_ref())?;
        }
        Some(current)
    }

    /// Character data of the element at a name path.
    pub fn child_text<S: AsRef<str>>(&self, path: &[S]) -> Option<String> {
        self.element_at_path(path).map(Element::text)
    }

    /// Condition of an error stanza, if present.
    pub fn error_condition(&self) -> Option<StanzaErrorCondition> {
        let error = self.element.children().find(|c| c.name() == "error")?;
        error
            .children()
            .filter(|c| c.ns() == ns::STANZAS)
            .find_map(|c| StanzaErrorCondition::from_name(c.name()))
    }

    /// Build an error response derived from this packet.
    ///
    /// Addresses are swapped, the id is kept, and the original children are
    /// copied when `include_original` is set. Fails with
    /// [`SmError::PacketErrorType`] when this packet is an error already.
    pub fn error_result(
        &self,
        condition: StanzaErrorCondition,
        text: Option<&str>,
        include_original: bool,
    ) -> Result<Packet, SmError> {
        if self.is_error() {
            return Err(SmError::PacketErrorType);
        }

        let stanza_ns = self.element.ns();
        let mut error = Element::builder("error", stanza_ns.clone())
            .attr("type", condition.default_type().as_str())
            .attr("code", condition.code().to_string())
            .append(Element::builder(condition.as_str(), ns::STANZAS).build());
        if let Some(text) = text {
            error = error.append(
                Element::builder("text", ns::STANZAS)
                    .append(Node::Text(text.to_string()))
                    .build(),
            );
        }

        let mut builder = self.response_builder("error");
        if include_original {
            for child in self.element.children() {
                builder = builder.append(child.clone());
            }
        }
        let element = builder.append(error.build()).build();

        Ok(self.response(element, Priority::High))
    }

    /// Build an `iq` result for this request with an optional payload.
    pub fn ok_result(&self, payload: Option<Element>) -> Packet {
        let mut builder = self.response_builder("result");
        if let Some(payload) = payload {
            builder = builder.append(payload);
        }
        self.response(builder.build(), self.priority)
    }

    /// Copy the element into a fresh packet without routing state.
    pub fn copy_element_only(&self) -> Packet {
        Packet {
            element: self.element.clone(),
            packet_from: None,
            packet_to: None,
            stanza_from: self.stanza_from.clone(),
            stanza_to: self.stanza_to.clone(),
            authorised_from: None,
            priority: self.priority,
            processed_by: BTreeSet::new(),
            command: None,
        }
    }

    fn response_builder(&self, ty: &str) -> minidom::element::ElementBuilder {
        let mut builder = Element::builder(self.elem_name(), self.element.ns()).attr("type", ty);
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if let Some(from) = &self.stanza_to {
            builder = builder.attr("from", from.to_string());
        }
        if let Some(to) = &self.stanza_from {
            builder = builder.attr("to", to.to_string());
        }
        builder
    }

    fn response(&self, element: Element, priority: Priority) -> Packet {
        Packet {
            element,
            packet_from: self.packet_to.clone(),
            packet_to: self.packet_from.clone(),
            stanza_from: self.stanza_to.clone(),
            stanza_to: self.stanza_from.clone(),
            authorised_from: None,
            priority,
            processed_by: BTreeSet::new(),
            command: None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} type={} id={} from={} to={}",
            self.elem_name(),
            self.type_attr().unwrap_or("-"),
            self.id().unwrap_or("-"),
            display_jid(self.stanza_from.as_ref()),
            display_jid(self.stanza_to.as_ref()),
        )
    }
}

fn display_jid(jid: Option<&Jid>) -> String {
    jid.map(|j| j.to_string()).unwrap_or_else(|| "-".to_string())
}

fn jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, SmError> {
    match element.attr(name) {
        Some(value) if !value.is_empty() => Ok(Some(Jid::new(value)?)),
        _ => Ok(None),
    }
}

/// Ordered outbound queue filled during one dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct Results {
    queue: VecDeque<Packet>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet.
    pub fn offer(&mut self, packet: Packet) {
        self.queue.push_back(packet);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Packet> {
        self.queue.iter()
    }

    pub fn iter_mut(&mut self) -> vec_deque::IterMut<'_, Packet> {
        self.queue.iter_mut()
    }

    pub fn front(&self) -> Option<&Packet> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    /// Keep only packets matching the predicate, preserving order.
    pub fn retain<F: FnMut(&Packet) -> bool>(&mut self, f: F) {
        self.queue.retain(f);
    }

    /// Take every queued packet, leaving the queue empty.
    pub fn take(&mut self) -> VecDeque<Packet> {
        std::mem::take(&mut self.queue)
    }

    /// Whether a transport directive is queued.
    pub fn has_command(&self, command: Command) -> bool {
        self.queue.iter().any(|p| p.command() == Some(command))
    }

    /// Error-typed packets in the queue.
    pub fn errors(&self) -> impl Iterator<Item = &Packet> {
        self.queue.iter().filter(|p| p.is_error())
    }

    /// Drain into a vector ordered by priority, stable within a priority.
    pub fn into_prioritized(self) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self.queue.into();
        packets.sort_by_key(Packet::priority);
        packets
    }
}

impl Extend<Packet> for Results {
    fn extend<T: IntoIterator<Item = Packet>>(&mut self, iter: T) {
        self.queue.extend(iter);
    }
}

impl IntoIterator for Results {
    type Item = Packet;
    type IntoIter = vec_deque::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.queue.into_iter()
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = &'a Packet;
    type IntoIter = vec_deque::Iter<'a, Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.queue.iter()
    }
}
