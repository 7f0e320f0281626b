use serde::Serializer;

/// Serde yaml represents things differently than just "JSON in YAML format".
/// We don't want this. Instead, transcode YAML through the JSON value model.
pub mod yamlviajson {
	use serde::de;

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let value: serde_json::Value = serde_yaml::from_str(s)?;
		Ok(serde_json::from_value(value)?)
	}
}

pub fn ser_redact<S: Serializer, T>(_t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

pub mod serde_dur {
	use std::time::Duration;

	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer>(t: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{}s", t.as_secs()))
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	#[derive(Debug, serde::Deserialize)]
	struct Holder {
		#[serde(with = "super::serde_dur")]
		d: Duration,
	}

	#[test]
	fn yaml_numbers_stay_numbers() {
		let v: serde_json::Value = super::yamlviajson::from_str("port: 1337").unwrap();
		assert_eq!(v["port"], serde_json::json!(1337));
	}

	#[test]
	fn durations_parse_human_format() {
		let h: Holder = serde_json::from_str(r#"{"d":"5m"}"#).unwrap();
		assert_eq!(h.d, Duration::from_secs(300));
	}
}
