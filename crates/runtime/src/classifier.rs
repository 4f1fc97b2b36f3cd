//! Query classification: who is asking, how urgent it is, and which clinical
//! facts the query already states.
//!
//! Every function here is total and deterministic.  Matching runs on a
//! normalized copy of the text (lower-cased, accents folded, `ñ` kept) so the
//! word lists can be written without diacritics.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    Patient,
    Professional,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Professional => "professional",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyLevel {
    #[default]
    Routine,
    Urgent,
    Emergency,
}

impl UrgencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::Urgent => "urgent",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Emergency phrase groups, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyCategory {
    Cardiac,
    Respiratory,
    Neurological,
    Trauma,
}

impl EmergencyCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cardiac => "cardiac",
            Self::Respiratory => "respiratory",
            Self::Neurological => "neurological",
            Self::Trauma => "trauma",
        }
    }
}

/// Facts pulled out of the query text.  Fields that were not found stay
/// empty and are left out of the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub medical_history: Vec<String>,
}

impl ClinicalContext {
    pub fn is_empty(&self) -> bool {
        self.age.is_none()
            && self.gender.is_none()
            && self.duration.is_none()
            && self.medical_history.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub user_type: UserType,
    pub urgency: UrgencyLevel,
    #[serde(default)]
    pub context: ClinicalContext,
}

impl Classification {
    pub fn is_emergency(&self) -> bool {
        self.urgency == UrgencyLevel::Emergency
    }
}

// ── Word lists ───────────────────────────────────────────────────────────────

const PROFESSIONAL_PATTERNS: &[&str] = &[
    r"paciente\s+de\s+\d+\s+años",
    r"patient\s+of\s+\d+\s+years",
    r"\d+[\s-]*years?[\s-]*old\s+(?:male|female|man|woman|patient)",
    r"caso\s+clinico",
    r"clinical\s+case",
    r"diagnostico\s+diferencial",
    r"differential\s+diagnosis",
    r"protocolo\s+de\s+manejo",
    r"management\s+protocol",
    r"tratamiento\s+con\s+\w+(?:\s+\d+)?\s*mg",
    r"dosis\s+de\s+\d+\s*mg",
    r"dose\s+of\s+\d+\s*mg",
    r"codigo\s+cie",
    r"icd-?10",
    r"manejo\s+hospitalario",
    r"hospital\s+management",
    r"seguimiento\s+ambulatorio",
    r"outpatient\s+follow-?up",
];

const PATIENT_INDICATORS: &[&str] = &[
    "me duele",
    "tengo",
    "siento",
    "me pasa",
    "estoy preocupado",
    "estoy preocupada",
    "que sera",
    "es normal",
    "debo preocuparme",
    "it hurts",
    "i have",
    "i feel",
    "i'm worried",
    "i am worried",
    "is this normal",
    "should i worry",
];

const EMERGENCY_PHRASES: &[(EmergencyCategory, &[&str])] = &[
    (
        EmergencyCategory::Cardiac,
        &[
            "dolor precordial",
            "dolor toracico",
            "dolor de pecho",
            "dolor pecho",
            "chest pain",
            "infarto",
            "heart attack",
            "sindrome coronario",
            "angina",
            "palpitaciones severas",
        ],
    ),
    (
        EmergencyCategory::Respiratory,
        &[
            "dificultad respiratoria severa",
            "disnea severa",
            "no puedo respirar",
            "cianosis",
            "edema pulmonar",
            "neumotorax",
            "embolia pulmonar",
            "can't breathe",
            "cannot breathe",
            "severe shortness of breath",
        ],
    ),
    (
        EmergencyCategory::Neurological,
        &[
            "accidente cerebrovascular",
            "ictus",
            "avc",
            "convulsiones",
            "convulsion",
            "perdida de conciencia",
            "perdida conciencia",
            "deficit neurologico agudo",
            "desmayo",
            "dolor de cabeza explosivo",
            "dolor cabeza explosivo",
            "peor dolor de mi vida",
            "peor dolor vida",
            "vision doble",
            "paralisis",
            "no puedo mover",
            "stroke",
            "seizure",
            "loss of consciousness",
        ],
    ),
    (
        EmergencyCategory::Trauma,
        &[
            "traumatismo craneal",
            "hemorragia masiva",
            "hemorragia abundante",
            "sangrado masivo",
            "shock",
            "fractura abierta",
            "lesion medular",
            "severe bleeding",
            "head injury",
        ],
    ),
];

const URGENT_WORDS: &[&str] = &[
    "urgente",
    "inmediato",
    "rapido",
    "ahora",
    "empeorando",
    "severo",
    "intenso",
    "urgent",
    "immediate",
    "worsening",
    "severe",
    "intense",
];

const MALE_WORDS: &[&str] = &["hombre", "masculino", "varon", "male", "man"];
const FEMALE_WORDS: &[&str] = &["mujer", "femenino", "femenina", "female", "woman"];

const HISTORY_TAGS: &[(&str, &[&str])] = &[
    ("Diabetes Mellitus", &["diabetes", "diabetico", "diabetica", "diabetic"]),
    (
        "Hipertensión Arterial",
        &["hipertension", "hipertenso", "hipertensa", "hypertension"],
    ),
    ("Cardiopatía", &["cardiaco", "cardiaca", "corazon", "cardiac", "heart disease"]),
];

// ── Compiled matchers ────────────────────────────────────────────────────────

/// `\b(?:a|b|c)\b` over escaped phrases.
fn word_set(phrases: &[&str]) -> Regex {
    let alternatives = phrases
        .iter()
        .map(|phrase| regex::escape(phrase))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\b(?:{alternatives})\b")).expect("escaped word list is a valid regex")
}

static PROFESSIONAL_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PROFESSIONAL_PATTERNS
        .iter()
        .map(|pattern| Regex::new(pattern).expect("professional pattern is a valid regex"))
        .collect()
});

static EMERGENCY_RE: LazyLock<Vec<(EmergencyCategory, Regex)>> = LazyLock::new(|| {
    EMERGENCY_PHRASES
        .iter()
        .map(|(category, phrases)| (*category, word_set(phrases)))
        .collect()
});

static URGENT_RE: LazyLock<Regex> = LazyLock::new(|| word_set(URGENT_WORDS));
static MALE_RE: LazyLock<Regex> = LazyLock::new(|| word_set(MALE_WORDS));
static FEMALE_RE: LazyLock<Regex> = LazyLock::new(|| word_set(FEMALE_WORDS));

static HISTORY_RE: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    HISTORY_TAGS
        .iter()
        .map(|(tag, words)| (*tag, word_set(words)))
        .collect()
});

static AGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3})\s*(?:-\s*)?(?:años?|years?)\b").expect("age pattern is a valid regex")
});

/// Hours, days, weeks, months: the first unit that matches wins.
static DURATION_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b\d+\s*(?:horas?|hours?|hrs?)\b",
        r"\b\d+\s*(?:dias?|days?)\b",
        r"\b\d+\s*(?:semanas?|weeks?)\b",
        r"\b\d+\s*(?:meses|mes|months?)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("duration pattern is a valid regex"))
    .collect()
});

// ── Public API ───────────────────────────────────────────────────────────────

/// Lower-case and strip the accents Spanish queries commonly carry.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            other => other,
        })
        .collect()
}

pub fn classify(text: &str) -> Classification {
    let normalized = normalize(text);
    Classification {
        user_type: user_type_of(&normalized),
        urgency: urgency_of(&normalized),
        context: context_of(&normalized),
    }
}

/// Professional framing beats patient phrasing; with no signal at all the
/// requester is treated as a patient.
pub fn detect_user_type(text: &str) -> UserType {
    user_type_of(&normalize(text))
}

pub fn detect_urgency(text: &str) -> UrgencyLevel {
    urgency_of(&normalize(text))
}

/// First emergency category whose phrase list matches, for logging.
pub fn emergency_category(text: &str) -> Option<EmergencyCategory> {
    emergency_category_of(&normalize(text))
}

pub fn extract_context(text: &str) -> ClinicalContext {
    context_of(&normalize(text))
}

// ── Internals (operate on normalized text) ───────────────────────────────────

fn user_type_of(normalized: &str) -> UserType {
    if PROFESSIONAL_RE.iter().any(|re| re.is_match(normalized)) {
        return UserType::Professional;
    }
    // Patient phrasing and no signal both land on Patient; the list is kept
    // so the precedence stays explicit.
    if PATIENT_INDICATORS.iter().any(|phrase| normalized.contains(phrase)) {
        return UserType::Patient;
    }
    UserType::Patient
}

fn emergency_category_of(normalized: &str) -> Option<EmergencyCategory> {
    EMERGENCY_RE
        .iter()
        .find(|(_, re)| re.is_match(normalized))
        .map(|(category, _)| *category)
}

fn urgency_of(normalized: &str) -> UrgencyLevel {
    if emergency_category_of(normalized).is_some() {
        UrgencyLevel::Emergency
    } else if URGENT_RE.is_match(normalized) {
        UrgencyLevel::Urgent
    } else {
        UrgencyLevel::Routine
    }
}

fn context_of(normalized: &str) -> ClinicalContext {
    let age = AGE_RE
        .captures(normalized)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let gender = if MALE_RE.is_match(normalized) {
        Some(Gender::Male)
    } else if FEMALE_RE.is_match(normalized) {
        Some(Gender::Female)
    } else {
        None
    };

    let duration = DURATION_RE
        .iter()
        .find_map(|re| re.find(normalized))
        .map(|m| m.as_str().to_string());

    let medical_history = HISTORY_RE
        .iter()
        .filter(|(_, re)| re.is_match(normalized))
        .map(|(tag, _)| tag.to_string())
        .collect();

    ClinicalContext {
        age,
        gender,
        duration,
        medical_history,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chest_pain_and_breathing_is_patient_emergency() {
        let c = classify("Me duele el pecho y no puedo respirar");
        assert_eq!(c.user_type, UserType::Patient);
        assert_eq!(c.urgency, UrgencyLevel::Emergency);
        assert_eq!(
            emergency_category("Me duele el pecho y no puedo respirar"),
            Some(EmergencyCategory::Respiratory)
        );
    }

    #[test]
    fn clinical_framing_is_professional_routine_with_age() {
        let c = classify("Paciente de 55 años con protocolo de manejo para diabetes, dosis de 850 mg");
        assert_eq!(c.user_type, UserType::Professional);
        assert_eq!(c.urgency, UrgencyLevel::Routine);
        assert_eq!(c.context.age, Some(55));
        assert_eq!(c.context.medical_history, vec!["Diabetes Mellitus"]);
    }

    #[test]
    fn professional_pattern_beats_patient_phrase() {
        assert_eq!(
            detect_user_type("patient of 60 years, I feel worried"),
            UserType::Professional
        );
        assert_eq!(
            detect_user_type("Tengo un caso clínico interesante"),
            UserType::Professional
        );
    }

    #[test]
    fn no_signal_defaults_to_patient_routine() {
        let c = classify("");
        assert_eq!(c.user_type, UserType::Patient);
        assert_eq!(c.urgency, UrgencyLevel::Routine);
        assert!(c.context.is_empty());

        assert_eq!(detect_user_type("Hola"), UserType::Patient);
    }

    #[test]
    fn classify_is_deterministic() {
        let text = "Mujer de 34 años, hipertensa, con cefalea intensa desde hace 3 días";
        assert_eq!(classify(text), classify(text));
    }

    #[test]
    fn any_single_category_triggers_emergency() {
        let cases = [
            ("siento dolor torácico", EmergencyCategory::Cardiac),
            ("mi hijo tiene cianosis", EmergencyCategory::Respiratory),
            ("tuvo convulsiones esta mañana", EmergencyCategory::Neurological),
            ("after the crash he has a head injury", EmergencyCategory::Trauma),
        ];
        for (text, category) in cases {
            assert_eq!(detect_urgency(text), UrgencyLevel::Emergency, "{text}");
            assert_eq!(emergency_category(text), Some(category), "{text}");
        }
    }

    #[test]
    fn emergency_phrases_respect_word_boundaries() {
        // "avc" inside "avcd" and "shock" inside "shockwave" are not phrases.
        assert_eq!(detect_urgency("resultado avcd normal"), UrgencyLevel::Routine);
        assert_eq!(detect_urgency("shockwave therapy info"), UrgencyLevel::Routine);
    }

    #[test]
    fn urgent_tone_without_emergency() {
        assert_eq!(detect_urgency("Necesito ayuda urgente con la fiebre"), UrgencyLevel::Urgent);
        assert_eq!(detect_urgency("the rash is worsening"), UrgencyLevel::Urgent);
        // "ahorro" contains "ahora" only as a prefix fragment.
        assert_eq!(detect_urgency("consejos de ahorro en farmacia"), UrgencyLevel::Routine);
    }

    #[test]
    fn accents_are_folded() {
        assert_eq!(normalize("Diagnóstico Diferencial"), "diagnostico diferencial");
        assert_eq!(normalize("Pingüino ÑANDÚ"), "pinguino ñandu");
        assert_eq!(detect_user_type("Diagnóstico diferencial de disnea"), UserType::Professional);
    }

    #[test]
    fn extracts_gender_duration_and_history() {
        let ctx = extract_context("Hombre diabético e hipertenso con fiebre desde hace 2 semanas");
        assert_eq!(ctx.gender, Some(Gender::Male));
        assert_eq!(ctx.duration.as_deref(), Some("2 semanas"));
        assert_eq!(
            ctx.medical_history,
            vec!["Diabetes Mellitus", "Hipertensión Arterial"]
        );

        let ctx = extract_context("a woman with heart disease");
        assert_eq!(ctx.gender, Some(Gender::Female));
        assert_eq!(ctx.medical_history, vec!["Cardiopatía"]);
    }

    #[test]
    fn duration_prefers_hours_over_days() {
        let ctx = extract_context("fiebre de 3 días, dolor desde hace 12 horas");
        assert_eq!(ctx.duration.as_deref(), Some("12 horas"));
    }

    #[test]
    fn female_is_not_matched_as_male() {
        assert_eq!(extract_context("female, 40").gender, Some(Gender::Female));
    }

    #[test]
    fn empty_context_fields_are_omitted_when_serialized() {
        let json = serde_json::to_value(extract_context("tengo tos")).unwrap();
        assert_eq!(json, serde_json::json!({}));

        let json = serde_json::to_value(extract_context("tengo 30 años")).unwrap();
        assert_eq!(json, serde_json::json!({"age": 30}));
    }
}
