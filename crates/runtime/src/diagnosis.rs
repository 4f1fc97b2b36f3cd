//! Structured diagnostic output and its clearly-marked fallback.

use serde::{Deserialize, Serialize};

use crate::classifier::Classification;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalAnalysis {
    pub chief_complaint: String,
    pub symptoms: Vec<String>,
    pub duration: String,
    pub severity: String,
    pub patient_type: String,
    pub urgency_level: String,
    pub differential_diagnosis: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub red_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResponse {
    pub analysis: MedicalAnalysis,
    pub clinical_reasoning: String,
    pub treatment_plan: Vec<String>,
    pub follow_up: Vec<String>,
    pub education: Vec<String>,
    pub warnings: Vec<String>,
    /// `true` when the model's reply could not be used and this value was
    /// synthesized locally.
    #[serde(default)]
    pub is_fallback: bool,
}

impl DiagnosticResponse {
    /// Conservative placeholder returned when no structured answer is
    /// available.  It only echoes the query and points to in-person care.
    pub fn fallback(query: &str, classification: &Classification, reason: &str) -> Self {
        Self {
            analysis: MedicalAnalysis {
                chief_complaint: query.chars().take(100).collect(),
                symptoms: Vec::new(),
                duration: classification
                    .context
                    .duration
                    .clone()
                    .unwrap_or_else(|| "No especificada".to_string()),
                severity: "No determinada".to_string(),
                patient_type: classification.user_type.as_str().to_string(),
                urgency_level: classification.urgency.as_str().to_string(),
                differential_diagnosis: Vec::new(),
                recommended_actions: vec!["Consultar con médico".to_string()],
                red_flags: Vec::new(),
            },
            clinical_reasoning: format!("Error en análisis estructurado: {reason}"),
            treatment_plan: vec!["Consultar profesional médico".to_string()],
            follow_up: vec!["Seguimiento médico apropiado".to_string()],
            education: vec!["Buscar atención médica".to_string()],
            warnings: vec!["Error en sistema, buscar atención médica".to_string()],
            is_fallback: true,
        }
    }
}
