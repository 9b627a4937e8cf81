//! # Inspection
//!
//! Metadata from the structs in this module can be used to visualise, store
//! and rebuild a graph. An inspection only covers the topology and the
//! templates on it; plays and their run state are never included.
//!
//! Units are referred to by their index in [`GraphInspection::units`] and
//! nodes by their line within the unit, so an inspection stays valid across
//! processes.

use crate::graph::operator::lock;
use crate::graph::{
    Behavior, Graph, GraphSettings, Holder, LinkError, NodeKey, Operator, OperatorKind,
    OperatorScope, Purpose, Side, UnitFlags, UnitKey, UnitSettings,
};

/// The metadata of a Graph
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphInspection {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub sample_rate: crate::Sample,
    #[allow(missing_docs)]
    pub block_size: usize,
    /// All the units currently in the Graph
    pub units: Vec<UnitInspection>,
    /// Every link, from output to input
    pub links: Vec<LinkInspection>,
}

/// Metadata about a unit in a graph
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitInspection {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub flags: UnitFlags,
    #[allow(missing_docs)]
    pub audio_channels: usize,
    #[allow(missing_docs)]
    pub output_pads: usize,
    #[allow(missing_docs)]
    pub input_pads: usize,
    /// Templates on the unit and its nodes
    pub templates: Vec<TemplateInspection>,
}

/// Where a template sits within its unit
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub enum TemplateHolder {
    Unit,
    Output(usize),
    Input(usize),
}

/// Metadata about a template. The behavior itself is recreated from the name
/// by the factory passed to [`Graph::from_inspection`].
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct TemplateInspection {
    pub holder: TemplateHolder,
    pub name: String,
    pub kind: OperatorKind,
    pub scope: OperatorScope,
    pub purposes: Purpose,
}

/// Metadata for a link.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-derive", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkInspection {
    pub from_unit: usize,
    pub from_line: usize,
    pub to_unit: usize,
    pub to_line: usize,
}

impl Graph {
    /// Create a [`GraphInspection`] of the current topology
    pub fn generate_inspection(&self) -> GraphInspection {
        let unit_keys: Vec<UnitKey> = self.units.keys().collect();
        let mut units = Vec::with_capacity(unit_keys.len());
        let mut links = vec![];
        for unit_key in &unit_keys {
            let unit = &self.units[*unit_key];
            let mut templates =
                self.template_inspections(Holder::Unit(*unit_key), TemplateHolder::Unit);
            for (line, output) in unit.outputs.iter().enumerate() {
                templates.extend(
                    self.template_inspections(Holder::Node(*output), TemplateHolder::Output(line)),
                );
                let Some(input) = self.nodes[*output].link else {
                    continue;
                };
                let Some((to_unit, to_line)) = self.locate(&unit_keys, input) else {
                    continue;
                };
                links.push(LinkInspection {
                    from_unit: units.len(),
                    from_line: line,
                    to_unit,
                    to_line,
                });
            }
            for (line, input) in unit.inputs.iter().enumerate() {
                templates.extend(
                    self.template_inspections(Holder::Node(*input), TemplateHolder::Input(line)),
                );
            }
            units.push(UnitInspection {
                name: unit.name.clone(),
                flags: unit.flags,
                audio_channels: unit.audio_channels,
                output_pads: unit.pads(Side::Output),
                input_pads: unit.pads(Side::Input),
                templates,
            });
        }
        GraphInspection {
            name: self.settings().name.clone(),
            sample_rate: self.settings().sample_rate,
            block_size: self.settings().block_size,
            units,
            links,
        }
    }

    fn template_inspections(
        &self,
        holder: Holder,
        at: TemplateHolder,
    ) -> Vec<TemplateInspection> {
        self.templates(holder)
            .iter()
            .map(|t| {
                let t = lock(t);
                TemplateInspection {
                    holder: at,
                    name: t.name().to_string(),
                    kind: t.kind(),
                    scope: t.scope_flags(),
                    purposes: t.purpose_flags(),
                }
            })
            .collect()
    }

    fn locate(&self, unit_keys: &[UnitKey], node: NodeKey) -> Option<(usize, usize)> {
        let n = self.nodes.get(node)?;
        let unit_index = unit_keys.iter().position(|k| *k == n.unit)?;
        Some((unit_index, n.line))
    }

    /// Rebuild a graph from an inspection.
    ///
    /// `template_factory` creates the behavior for every template; templates
    /// it returns `None` for are skipped with a warning. Kind, scope and
    /// purposes are taken from the inspection.
    pub fn from_inspection(
        inspection: &GraphInspection,
        mut template_factory: impl FnMut(&TemplateInspection) -> Option<Box<dyn Behavior>>,
    ) -> Result<Graph, LinkError> {
        let mut graph = Graph::new(
            GraphSettings::default()
                .name(inspection.name.clone())
                .sample_rate(inspection.sample_rate)
                .block_size(inspection.block_size),
        );
        let mut unit_keys = Vec::with_capacity(inspection.units.len());
        for unit in &inspection.units {
            let key = graph.add_unit(
                UnitSettings::default()
                    .name(unit.name.clone())
                    .flags(unit.flags)
                    .audio_channels(unit.audio_channels)
                    .output_pads(unit.output_pads)
                    .input_pads(unit.input_pads),
            );
            for template in &unit.templates {
                let holder = match template.holder {
                    TemplateHolder::Unit => Some(Holder::Unit(key)),
                    TemplateHolder::Output(line) => {
                        graph.units[key].outputs.get(line).map(|n| Holder::Node(*n))
                    }
                    TemplateHolder::Input(line) => {
                        graph.units[key].inputs.get(line).map(|n| Holder::Node(*n))
                    }
                };
                let (Some(holder), Some(behavior)) = (holder, template_factory(template)) else {
                    tracing::warn!("from_inspection: template \"{}\" skipped", template.name);
                    continue;
                };
                let operator = Operator::from_boxed(behavior, template.kind)
                    .purposes(template.purposes)
                    .scope(template.scope);
                if let Err(e) = graph.add_template(holder, operator) {
                    tracing::warn!("from_inspection: {e}");
                }
            }
            unit_keys.push(key);
        }
        for link in &inspection.links {
            let output = unit_keys
                .get(link.from_unit)
                .and_then(|u| graph.units[*u].outputs.get(link.from_line).copied())
                .ok_or(LinkError::NodeNotFound)?;
            let input = unit_keys
                .get(link.to_unit)
                .and_then(|u| graph.units[*u].inputs.get(link.to_line).copied())
                .ok_or(LinkError::NodeNotFound)?;
            graph.set_link(output, Some(input))?;
        }
        Ok(graph)
    }
}
