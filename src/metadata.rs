//! Run metadata persisted under `settings/` in every dataset.
//!
//! `RunMetadata` is assembled while opening the file: the `general` section comes from
//! the UI settings, one section per instrument from the instrument's own description
//! plus the run parameters that were applied to it. Each section becomes the
//! attributes of `settings/<section>`.
//!
//! ## `RunMetadataBuilder`
//!
//! Builder that collects the sections step by step and validates the result, so a
//! dataset is never opened with an incomplete `general` section.

use crate::config::settings_ui::GeneralSettings;
use crate::config::topology::SubstrateGeometry;
use crate::data::{AttrValue, Attributes};
use crate::error::{AppResult, DaqError};
use crate::experiment::geometry::AxisLayout;
use crate::experiment::ExperimentKind;
use std::collections::BTreeMap;

/// Settings snapshot of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    /// Experiment of the run.
    pub experiment: ExperimentKind,
    /// Sample name from the UI.
    pub sample: String,
    /// Free-text comment.
    pub comment: String,
    /// Substrate key.
    pub substrate: String,
    /// Excitation filter choice.
    pub filter_excitation: String,
    /// Emission filter choice.
    pub filter_emission: String,
    /// Per-subsystem attributes (`xystage`, `spectrometer`, ...).
    pub sections: BTreeMap<String, Attributes>,
    /// Version of the acquisition software.
    pub software_version: String,
}

impl RunMetadata {
    /// Attributes of `settings/general`.
    pub fn general(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("experiment".into(), self.experiment.as_str().into());
        attrs.insert("sample".into(), self.sample.as_str().into());
        attrs.insert("comment".into(), self.comment.as_str().into());
        attrs.insert("substrate".into(), self.substrate.as_str().into());
        attrs.insert(
            "filter_excitation".into(),
            self.filter_excitation.as_str().into(),
        );
        attrs.insert("filter_emission".into(), self.filter_emission.as_str().into());
        attrs.insert(
            "software_version".into(),
            self.software_version.as_str().into(),
        );
        attrs
    }

    /// Every `settings/<name>` group, `general` first.
    pub fn groups(&self) -> Vec<(String, Attributes)> {
        let mut groups = vec![("general".to_string(), self.general())];
        groups.extend(
            self.sections
                .iter()
                .map(|(name, attrs)| (name.clone(), attrs.clone())),
        );
        groups
    }

    /// Reject metadata that cannot identify the run.
    pub fn validate(&self) -> AppResult<()> {
        if self.sections.keys().any(|name| name.is_empty() || name == "general") {
            return Err(DaqError::Dataset(
                "Settings sections need a name other than 'general'".to_string(),
            ));
        }
        if self.experiment.scans_positions() && !self.sections.contains_key("xystage") {
            return Err(DaqError::Dataset(format!(
                "{} metadata lacks the xystage section",
                self.experiment
            )));
        }
        Ok(())
    }
}

/// Attributes of `settings/xystage`.
pub fn xystage_attributes(
    geometry: &SubstrateGeometry,
    x: &AxisLayout,
    y: &AxisLayout,
) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("ws".into(), geometry.ws.into());
    attrs.insert("hs".into(), geometry.hs.into());
    attrs.insert("whse".into(), geometry.whse.into());
    attrs.insert("hhse".into(), geometry.hhse.into());
    attrs.insert("x_off_left".into(), x.edge_off1.into());
    attrs.insert("x_off_right".into(), x.edge_off2.into());
    attrs.insert("y_off_top".into(), y.edge_off1.into());
    attrs.insert("y_off_bottom".into(), y.edge_off2.into());
    attrs.insert("xnum".into(), x.positions.len().into());
    attrs.insert("ynum".into(), y.positions.len().into());
    attrs
}

/// A builder for constructing `RunMetadata` instances.
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    pub fn new(experiment: ExperimentKind) -> Self {
        Self {
            inner: RunMetadata {
                experiment,
                sample: String::new(),
                comment: String::new(),
                substrate: String::new(),
                filter_excitation: String::new(),
                filter_emission: String::new(),
                sections: BTreeMap::new(),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn general(mut self, general: &GeneralSettings) -> Self {
        self.inner.sample = general.sample.clone();
        self.inner.comment = general.comment.clone();
        self.inner.substrate = general.substrate.clone();
        self.inner.filter_excitation = general.filter_excitation.clone();
        self.inner.filter_emission = general.filter_emission.clone();
        self
    }

    /// Merge attributes into a section.
    pub fn section(mut self, name: &str, attrs: Attributes) -> Self {
        self.inner
            .sections
            .entry(name.to_string())
            .or_default()
            .extend(attrs);
        self
    }

    /// Set one attribute of a section.
    pub fn attribute(mut self, section: &str, key: &str, value: impl Into<AttrValue>) -> Self {
        self.inner
            .sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> AppResult<RunMetadata> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn general() -> GeneralSettings {
        GeneralSettings {
            sample: "quartz".into(),
            comment: "second batch".into(),
            substrate: "quartz_25".into(),
            filter_excitation: "none".into(),
            filter_emission: "LP450".into(),
        }
    }

    #[test]
    fn test_builder_collects_sections() {
        let metadata = RunMetadataBuilder::new(ExperimentKind::Decay)
            .general(&general())
            .attribute("xystage", "xnum", 2usize)
            .attribute("laser", "energy_level", "adjust")
            .section("laser", Attributes::from([("model".to_string(), "simulated".into())]))
            .build()
            .unwrap();
        let groups = metadata.groups();
        assert_eq!(groups[0].0, "general");
        assert_eq!(groups[0].1.get("experiment"), Some(&AttrValue::from("decay")));
        let laser = &metadata.sections["laser"];
        assert_eq!(laser.len(), 2);
    }

    #[test]
    fn test_validation() {
        assert!(RunMetadataBuilder::new(ExperimentKind::Calibration)
            .general(&general())
            .attribute("general", "sample", "x")
            .build()
            .is_err());
        assert!(RunMetadataBuilder::new(ExperimentKind::Transmission)
            .general(&general())
            .build()
            .is_err());
        assert!(RunMetadataBuilder::new(ExperimentKind::Calibration)
            .general(&general())
            .build()
            .is_ok());
    }
}
