//! Libvirt descriptor parsing and generation.
//!
//! Descriptors are parsed once per fetch into typed values so no caller
//! walks XML itself. Generation covers the small documents this crate
//! hands to the daemon (network definitions, interface devices) and the
//! domain documents the mock daemon serves.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};

/// Default NIC model.
pub const DEFAULT_NIC_MODEL: &str = "virtio";

// =============================================================================
// DOMAIN DESCRIPTOR
// =============================================================================

/// One `<interface>` of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub mac: Option<String>,
    pub network: Option<String>,
    pub bridge: Option<String>,
    pub model: Option<String>,
}

impl InterfaceDescriptor {
    /// Case-insensitive hardware address comparison.
    pub fn has_mac(&self, mac: &str) -> bool {
        self.mac
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case(mac))
            .unwrap_or(false)
    }

    /// Parse a standalone `<interface>` device document.
    pub fn parse(xml: &str) -> Result<Self> {
        let wrapped = format!("<domain><devices>{}</devices></domain>", xml);
        DomainDescriptor::parse(&wrapped)?
            .interfaces
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::XmlError("no <interface> element".to_string()))
    }

    /// Device XML suitable for attach/detach calls.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        let kind = if self.bridge.is_some() && self.network.is_none() {
            "bridge"
        } else {
            "network"
        };
        xml.push_str(&format!("<interface type='{}'>\n", kind));

        if let Some(ref mac) = self.mac {
            xml.push_str(&format!("  <mac address='{}'/>\n", escape(mac.as_str())));
        }
        if let Some(ref network) = self.network {
            xml.push_str(&format!("  <source network='{}'/>\n", escape(network.as_str())));
        } else if let Some(ref bridge) = self.bridge {
            xml.push_str(&format!("  <source bridge='{}'/>\n", escape(bridge.as_str())));
        }
        let model = self.model.as_deref().unwrap_or(DEFAULT_NIC_MODEL);
        xml.push_str(&format!("  <model type='{}'/>\n", escape(model)));
        xml.push_str("</interface>");
        xml
    }
}

/// The parts of a domain descriptor the orchestrator consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: Option<String>,
    pub uuid: Option<String>,
    /// Source path of every file-backed `<disk>`, in document order.
    /// Host block devices and directories are never listed.
    pub disk_paths: Vec<String>,
    /// Firmware variable store (`<os><nvram>`).
    pub nvram_path: Option<String>,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DomainDescriptor {
    /// Parse a domain XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut desc = DomainDescriptor::default();
        let mut stack: Vec<String> = Vec::new();
        let mut current_iface: Option<InterfaceDescriptor> = None;
        let mut disk_type: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let tag = tag_name(&e);
                    let parent = stack.last().map(String::as_str);
                    match (parent, tag.as_str()) {
                        (Some("devices"), "interface") => {
                            current_iface = Some(InterfaceDescriptor::default());
                        }
                        (Some("devices"), "disk") => disk_type = attr(&e, "type")?,
                        (Some("disk"), "source") => {
                            desc.push_disk_source(disk_type.as_deref(), &e)?
                        }
                        (Some("interface"), _) => {
                            if let Some(ref mut iface) = current_iface {
                                apply_interface_child(iface, &tag, &e)?;
                            }
                        }
                        _ => {}
                    }
                    stack.push(tag);
                }
                Ok(Event::Empty(e)) => {
                    let tag = tag_name(&e);
                    let parent = stack.last().map(String::as_str);
                    match (parent, tag.as_str()) {
                        (Some("devices"), "interface") => {
                            desc.interfaces.push(InterfaceDescriptor::default());
                        }
                        (Some("disk"), "source") => {
                            desc.push_disk_source(disk_type.as_deref(), &e)?
                        }
                        (Some("interface"), _) => {
                            if let Some(ref mut iface) = current_iface {
                                apply_interface_child(iface, &tag, &e)?;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| HypervisorError::XmlError(e.to_string()))?
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match path_tail(&stack) {
                        ["domain", "name"] => desc.name = Some(text),
                        ["domain", "uuid"] => desc.uuid = Some(text),
                        ["os", "nvram"] => desc.nvram_path = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    stack.pop();
                    if stack.last().map(String::as_str) == Some("devices") {
                        match tag.as_str() {
                            "interface" => {
                                if let Some(iface) = current_iface.take() {
                                    desc.interfaces.push(iface);
                                }
                            }
                            "disk" => disk_type = None,
                            _ => {}
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(HypervisorError::XmlError(format!(
                        "domain descriptor at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        Ok(desc)
    }

    /// Record the source of a `<disk>` whose `type` is `file` (the
    /// daemon's default when the attribute is absent).
    fn push_disk_source(&mut self, disk_type: Option<&str>, e: &BytesStart<'_>) -> Result<()> {
        if !matches!(disk_type, None | Some("file")) {
            return Ok(());
        }
        if let Some(path) = attr(e, "file")? {
            self.disk_paths.push(path);
        }
        Ok(())
    }

    /// Hardware addresses of every interface, in document order.
    pub fn macs(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .filter_map(|i| i.mac.clone())
            .collect()
    }

    /// Network names referenced by interfaces, deduplicated, in order.
    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.interfaces.iter().filter_map(|i| i.network.as_ref()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Interface whose hardware address matches, ignoring case.
    pub fn find_interface(&self, mac: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.has_mac(mac))
    }

    /// Every storage artifact worth removing on delete.
    pub fn artifact_paths(&self) -> Vec<String> {
        let mut paths = self.disk_paths.clone();
        if let Some(ref nvram) = self.nvram_path {
            paths.push(nvram.clone());
        }
        paths
    }
}

fn apply_interface_child(
    iface: &mut InterfaceDescriptor,
    tag: &str,
    e: &BytesStart<'_>,
) -> Result<()> {
    match tag {
        "mac" => iface.mac = attr(e, "address")?,
        "source" => {
            iface.network = attr(e, "network")?;
            iface.bridge = attr(e, "bridge")?;
        }
        "model" => iface.model = attr(e, "type")?,
        _ => {}
    }
    Ok(())
}

// =============================================================================
// NETWORK DESCRIPTOR
// =============================================================================

/// The parts of a network descriptor the orchestrator consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub name: Option<String>,
    pub bridge: Option<String>,
    pub forward_mode: Option<String>,
}

impl NetworkDescriptor {
    /// Parse a network XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut desc = NetworkDescriptor::default();
        let mut stack: Vec<String> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let tag = tag_name(&e);
                    desc.apply(stack.last().map(String::as_str), &tag, &e)?;
                    stack.push(tag);
                }
                Ok(Event::Empty(e)) => {
                    let tag = tag_name(&e);
                    desc.apply(stack.last().map(String::as_str), &tag, &e)?;
                }
                Ok(Event::Text(t)) => {
                    if path_tail(&stack) == ["network", "name"] {
                        let text = t
                            .unescape()
                            .map_err(|e| HypervisorError::XmlError(e.to_string()))?;
                        desc.name = Some(text.trim().to_string());
                    }
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(HypervisorError::XmlError(format!(
                        "network descriptor at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        Ok(desc)
    }

    fn apply(&mut self, parent: Option<&str>, tag: &str, e: &BytesStart<'_>) -> Result<()> {
        match (parent, tag) {
            (Some("network"), "bridge") => self.bridge = attr(e, "name")?,
            (Some("network"), "forward") => self.forward_mode = attr(e, "mode")?,
            _ => {}
        }
        Ok(())
    }
}

/// Network definition bound to an existing host bridge.
pub fn bridged_network_xml(name: &str, bridge: &str) -> String {
    format!(
        "<network>\n  <name>{}</name>\n  <forward mode='bridge'/>\n  <bridge name='{}'/>\n</network>",
        escape(name),
        escape(bridge)
    )
}

// =============================================================================
// DOMAIN XML (mock daemon)
// =============================================================================

/// Builder for the domain documents the mock daemon serves.
pub struct DomainXmlBuilder<'a> {
    name: &'a str,
    uuid: &'a str,
    memory_kib: u64,
    vcpus: u32,
    disks: Vec<(&'a str, &'a str)>,
    nvram: Option<&'a str>,
    interfaces: &'a [InterfaceDescriptor],
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(name: &'a str, uuid: &'a str) -> Self {
        Self {
            name,
            uuid,
            memory_kib: 0,
            vcpus: 1,
            disks: Vec::new(),
            nvram: None,
            interfaces: &[],
        }
    }

    pub fn memory_kib(mut self, memory_kib: u64) -> Self {
        self.memory_kib = memory_kib;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Add a disk; `device` is `disk`, `cdrom`, or `block` for a host
    /// block device passed through to the guest.
    pub fn disk(mut self, path: &'a str, device: &'a str) -> Self {
        self.disks.push((path, device));
        self
    }

    pub fn nvram(mut self, path: Option<&'a str>) -> Self {
        self.nvram = path;
        self
    }

    pub fn interfaces(mut self, interfaces: &'a [InterfaceDescriptor]) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = format!(
            "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  <memory unit='KiB'>{}</memory>\n  <vcpu placement='static'>{}</vcpu>\n",
            escape(self.name),
            escape(self.uuid),
            self.memory_kib,
            self.vcpus
        );

        xml.push_str("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n");
        if let Some(nvram) = self.nvram {
            xml.push_str(&format!("    <nvram>{}</nvram>\n", escape(nvram)));
        }
        xml.push_str("  </os>\n  <devices>\n");

        for (i, (path, device)) in self.disks.iter().enumerate() {
            let dev = format!("vd{}", (b'a' + i as u8) as char);
            let (kind, device, source) = match *device {
                "block" => ("block", "disk", "dev"),
                other => ("file", other, "file"),
            };
            xml.push_str(&format!(
                "    <disk type='{}' device='{}'>\n      <source {}='{}'/>\n      <target dev='{}' bus='virtio'/>\n    </disk>\n",
                kind,
                device,
                source,
                escape(*path),
                dev
            ));
        }

        for iface in self.interfaces {
            for line in iface.to_xml().lines() {
                xml.push_str("    ");
                xml.push_str(line);
                xml.push('\n');
            }
        }

        xml.push_str("  </devices>\n</domain>\n");
        xml
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| HypervisorError::XmlError(err.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| HypervisorError::XmlError(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Last two element names on the stack.
fn path_tail(stack: &[String]) -> [&str; 2] {
    match stack {
        [.., a, b] => [a.as_str(), b.as_str()],
        [b] => ["", b.as_str()],
        [] => ["", ""],
    }
}
