//! Topology export as Graphviz DOT

use meshcoord_shared::{Device, DeviceMap, NodeType, TopologyLink};
use std::fmt::Write;

/// Render the device map and a link-quality scan as a directed graph.
///
/// Every device becomes a record node; every scanned link becomes an edge
/// from child to parent labelled with its link quality. Zero-quality links
/// are drawn dashed.
pub fn export_graph(devices: &DeviceMap, links: &[TopologyLink]) -> String {
    let mut text = String::from("digraph G {\nnode[shape=record];\n");

    for (address, device) in devices {
        let _ = writeln!(
            text,
            "  \"{}\" [{}, label=\"{{{}}}\"];",
            escape_id(address),
            node_style(device.node_type),
            node_label(address, device)
        );
    }

    for link in links {
        let line_style = if link.lqi == 0 { "style=\"dashed\", " } else { "" };
        let _ = writeln!(
            text,
            "  \"{}\" -> \"{}\" [{}label=\"{}\"];",
            escape_id(&link.child),
            escape_id(&link.parent),
            line_style,
            link.lqi
        );
    }

    text.push('}');
    text.replace('\0', "")
}

fn node_style(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Coordinator => "style=\"bold\"",
        NodeType::Router => "style=\"rounded\"",
        NodeType::EndDevice | NodeType::Unknown => "style=\"rounded, dashed\"",
    }
}

fn node_label(address: &str, device: &Device) -> String {
    let overdue = match device.overdue {
        Some(overdue) => overdue.to_string(),
        None => "unknown".into(),
    };
    let fields = [
        address.to_string(),
        device.name.clone(),
        device.manufacturer.clone().unwrap_or_default(),
        device.model_id.clone().unwrap_or_default(),
        device.power_source.clone().unwrap_or_default(),
        format!(
            "overdue={} status={}",
            overdue,
            device.status.as_deref().unwrap_or("unknown")
        ),
    ];

    fields
        .iter()
        .map(|field| escape_record(field))
        .collect::<Vec<_>>()
        .join("|")
}

/// Escape characters with a meaning inside record labels
fn escape_record(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if matches!(c, '{' | '}' | '|' | '<' | '>' | '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_id(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}
