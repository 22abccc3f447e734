//! Instance URI parsing and validation.

// std
use std::{fmt, str::FromStr};
// self
use crate::_prelude::*;

/// Fully-qualified identifier of a single AlloyDB instance.
///
/// Takes the form
/// `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`,
/// where `<PROJECT>` may be domain-scoped (`<DOMAIN>:<PROJECT>`). Two URIs are
/// equal iff all four components match case-sensitively, and a parsed URI
/// re-serialises to exactly the input it was parsed from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceUri {
	project: String,
	region: String,
	cluster: String,
	instance: String,
}
impl InstanceUri {
	/// Google Cloud project the instance resides in; may contain a domain
	/// prefix separated by `:`.
	pub fn project(&self) -> &str {
		&self.project
	}

	/// Google Cloud region of the instance.
	pub fn region(&self) -> &str {
		&self.region
	}

	/// Cluster the instance belongs to.
	pub fn cluster(&self) -> &str {
		&self.cluster
	}

	/// Instance name within the cluster.
	pub fn instance(&self) -> &str {
		&self.instance
	}

	/// Resource path of the owning cluster, as used by the certificate RPC.
	pub(crate) fn cluster_path(&self) -> String {
		format!(
			"projects/{}/locations/{}/clusters/{}",
			self.project, self.region, self.cluster
		)
	}
}
impl FromStr for InstanceUri {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		let malformed = |reason: String| Error::Config { field: "instance_uri", reason };
		let segments: Vec<&str> = value.split('/').collect();

		if segments.len() != 8
			|| segments[0] != "projects"
			|| segments[2] != "locations"
			|| segments[4] != "clusters"
			|| segments[6] != "instances"
		{
			return Err(malformed(format!(
				"Must have format projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>, got '{value}'."
			)));
		}

		let project = segments[1];
		// Domain-scoped projects carry exactly one ':' with non-empty halves.
		let project_ok = match project.split_once(':') {
			None => !project.is_empty(),
			Some((domain, name)) =>
				!domain.is_empty() && !name.is_empty() && !name.contains(':'),
		};

		if !project_ok {
			return Err(malformed(format!("Invalid project component '{project}'.")));
		}

		for (name, component) in
			[("region", segments[3]), ("cluster", segments[5]), ("instance", segments[7])]
		{
			if component.is_empty() || component.contains(':') {
				return Err(malformed(format!("Invalid {name} component '{component}'.")));
			}
		}

		Ok(Self {
			project: project.into(),
			region: segments[3].into(),
			cluster: segments[5].into(),
			instance: segments[7].into(),
		})
	}
}
impl fmt::Display for InstanceUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"projects/{}/locations/{}/clusters/{}/instances/{}",
			self.project, self.region, self.cluster, self.instance
		)
	}
}
