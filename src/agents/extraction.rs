//! Structured outputs of the extraction modules.
//!
//! The model is asked for JSON; these types give that JSON a fixed shape so a
//! malformed reply fails the job (and is retried) instead of being stored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloodPressure {
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
}

impl BloodPressure {
    pub fn is_complete(&self) -> bool {
        self.systolic.is_some() && self.diastolic.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthMetrics {
    pub bmi: Option<f64>,
    /// cm
    pub height: Option<f64>,
    /// kg
    pub weight: Option<f64>,
    /// bpm
    pub heart_rate: Option<f64>,
    pub blood_pressure: Option<BloodPressure>,
    /// percent
    pub blood_oxygen: Option<f64>,
}

impl HealthMetrics {
    /// Names of the metrics the conversation actually stated.
    pub fn recorded(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.bmi.is_some() {
            names.push("bmi");
        }
        if self.height.is_some() {
            names.push("height");
        }
        if self.weight.is_some() {
            names.push("weight");
        }
        if self.heart_rate.is_some() {
            names.push("heartRate");
        }
        if self.blood_pressure.as_ref().is_some_and(BloodPressure::is_complete) {
            names.push("bloodPressure");
        }
        if self.blood_oxygen.is_some() {
            names.push("bloodOxygen");
        }
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonalInfo {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub age: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VitalSigns {
    pub blood_pressure: Option<BloodPressure>,
    pub heart_rate: Option<f64>,
    pub blood_oxygen: Option<f64>,
}

impl VitalSigns {
    fn any(&self) -> bool {
        self.blood_pressure.as_ref().is_some_and(BloodPressure::is_complete)
            || self.heart_rate.is_some()
            || self.blood_oxygen.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedInfo {
    pub personal_info: PersonalInfo,
    pub vital_signs: VitalSigns,
    pub symptoms: Option<Vec<String>>,
    pub medications: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessReport {
    pub has_enough_information: bool,
    pub missing_critical_info: Vec<String>,
    pub urgency_level: String,
    pub reasoning: String,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn non_empty(list: &Option<Vec<String>>) -> bool {
    list.as_ref().is_some_and(|l| !l.is_empty())
}

impl CompletenessReport {
    pub fn from_extracted(info: &ExtractedInfo) -> Self {
        let identified =
            present(&info.personal_info.name) && present(&info.personal_info.date_of_birth);
        let has_enough_information = identified
            || info.vital_signs.any()
            || non_empty(&info.symptoms)
            || non_empty(&info.medications);

        let checks = [
            (present(&info.personal_info.name), "Name"),
            (present(&info.personal_info.date_of_birth), "Date of Birth"),
            (
                info.vital_signs
                    .blood_pressure
                    .as_ref()
                    .is_some_and(BloodPressure::is_complete),
                "Blood Pressure",
            ),
            (info.vital_signs.heart_rate.is_some(), "Heart Rate"),
            (info.symptoms.is_some(), "Symptoms"),
            (info.medications.is_some(), "Current Medications"),
        ];
        let missing_critical_info = checks
            .iter()
            .filter(|(found, _)| !found)
            .map(|(_, label)| label.to_string())
            .collect();

        Self {
            has_enough_information,
            missing_critical_info,
            urgency_level: "low".to_string(),
            reasoning: "Information gathering in progress".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_tolerate_missing_fields() {
        let metrics: HealthMetrics =
            serde_json::from_str(r#"{"heartRate": 72, "bloodPressure": {"systolic": 120, "diastolic": null}}"#)
                .unwrap();
        assert_eq!(metrics.heart_rate, Some(72.0));
        assert_eq!(metrics.recorded(), vec!["heartRate"]);
    }

    #[test]
    fn test_empty_extraction_is_incomplete() {
        let report = CompletenessReport::from_extracted(&ExtractedInfo::default());
        assert!(!report.has_enough_information);
        assert_eq!(report.missing_critical_info.len(), 6);
        assert_eq!(report.urgency_level, "low");
    }

    #[test]
    fn test_symptoms_alone_are_enough() {
        let info: ExtractedInfo = serde_json::from_str(
            r#"{"personalInfo": {"name": "Ada"}, "symptoms": ["headache"], "medications": null}"#,
        )
        .unwrap();
        let report = CompletenessReport::from_extracted(&info);
        assert!(report.has_enough_information);
        assert!(report.missing_critical_info.contains(&"Date of Birth".to_string()));
        assert!(!report.missing_critical_info.contains(&"Name".to_string()));
        assert!(!report.missing_critical_info.contains(&"Symptoms".to_string()));
    }

    #[test]
    fn test_name_without_birth_date_is_not_enough() {
        let info: ExtractedInfo =
            serde_json::from_str(r#"{"personalInfo": {"name": "Ada", "dateOfBirth": ""}}"#).unwrap();
        assert!(!CompletenessReport::from_extracted(&info).has_enough_information);
    }
}
