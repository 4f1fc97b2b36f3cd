//! Centralized prompt assembly.
//!
//! Every builder here is synchronous and pure: callers pass the clock reading
//! in, so identical inputs always render identical text.

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

use crate::classifier::{Classification, UrgencyLevel, UserType};
use crate::knowledge::KnowledgeHit;

// ─── chat system prompt ──────────────────────────────────────────────────────

/// Everything the chat system prompt depends on.
pub struct PromptInputs<'a> {
    pub assistant_name: &'a str,
    pub classification: &'a Classification,
    /// Caller-supplied side channel (e.g. an image flag).  Extracted clinical
    /// context is merged over it.
    pub context: &'a Map<String, Value>,
    pub now: DateTime<FixedOffset>,
}

/// Header, user-type block, emergency block (emergencies only), then the
/// capabilities and disclaimers block.
pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = build_header_block(inputs);
    prompt.push_str(user_type_block(inputs.classification.user_type));
    if inputs.classification.urgency == UrgencyLevel::Emergency {
        prompt.push_str(EMERGENCY_BLOCK);
    }
    prompt.push_str(CLOSING_BLOCK);
    prompt
}

/// Caller context with the classifier's extracted fields layered on top.
pub fn merged_context(classification: &Classification, context: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = context.clone();
    if let Ok(Value::Object(extracted)) = serde_json::to_value(&classification.context) {
        merged.extend(extracted);
    }
    merged
}

fn build_header_block(inputs: &PromptInputs<'_>) -> String {
    let context = merged_context(inputs.classification, inputs.context);
    let context_json = serde_json::to_string(&context).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Eres {name}, un sistema de inteligencia artificial médica avanzada.\n\n\
         FECHA Y HORA ACTUAL: {now}\n\n\
         INFORMACIÓN DEL CONTEXTO:\n\
         - Tipo de usuario: {user_type}\n\
         - Nivel de urgencia: {urgency}\n\
         - Contexto médico: {context_json}\n\n",
        name = inputs.assistant_name,
        now = inputs.now.format("%Y-%m-%d %H:%M:%S"),
        user_type = inputs.classification.user_type.as_str(),
        urgency = inputs.classification.urgency.as_str().to_uppercase(),
    )
}

fn user_type_block(user_type: UserType) -> &'static str {
    match user_type {
        UserType::Professional => PROFESSIONAL_BLOCK,
        UserType::Patient => PATIENT_BLOCK,
    }
}

const PROFESSIONAL_BLOCK: &str = "MODO PROFESIONAL MÉDICO ACTIVADO:\n\n\
PROTOCOLOS DE RESPUESTA:\n\
- Proporciona análisis clínico detallado con evidencia científica\n\
- Incluye diagnósticos diferenciales con probabilidades estimadas\n\
- Especifica protocolos de manejo y dosis farmacológicas exactas\n\
- Cita guías clínicas actuales cuando sea relevante\n\
- Indica criterios de derivación y seguimiento\n\
- Usa terminología médica apropiada\n\
- Incluye códigos CIE-10 cuando corresponda\n\n";

const PATIENT_BLOCK: &str = "MODO PACIENTE ACTIVADO:\n\n\
PROTOCOLOS DE RESPUESTA:\n\
- Usa lenguaje claro y comprensible\n\
- Proporciona información educativa sin alarmar innecesariamente\n\
- Enfatiza cuándo es importante buscar atención médica\n\
- Incluye medidas de autocuidado apropiadas\n\
- Mantén un tono empático y tranquilizador\n\
- Evita diagnósticos específicos o definitivos\n\n";

const EMERGENCY_BLOCK: &str = "🚨 PROTOCOLO DE EMERGENCIA ACTIVADO 🚨\n\n\
INSTRUCCIONES CRÍTICAS:\n\
- Evalúa si se requiere atención médica inmediata\n\
- Proporciona pasos de acción específicos y claros\n\
- Incluye cuándo llamar al servicio de emergencias\n\
- No minimices síntomas potencialmente graves\n\
- Prioriza la seguridad del paciente\n\n";

const CLOSING_BLOCK: &str = "CAPACIDADES ESPECIALES:\n\
- Análisis de imágenes médicas (radiografías, ECGs, laboratorios)\n\
- Búsqueda de información médica actualizada\n\
- Respuestas estructuradas en formato JSON cuando sea apropiado\n\
- Razonamiento clínico paso a paso\n\n\
DISCLAIMERS IMPORTANTES:\n\
- Esta información es solo educativa y no reemplaza la consulta médica presencial\n\
- En emergencias reales, contacta a los servicios de emergencia inmediatamente\n\
- Busca siempre atención médica profesional para diagnóstico y tratamiento\n\n\
INSTRUCCIONES DE RESPUESTA:\n\
- Estructura la información de manera clara\n\
- Incluye recomendaciones específicas basadas en evidencia\n\
- Adapta el nivel de detalle al tipo de usuario";

// ─── knowledge-base context ──────────────────────────────────────────────────

/// Render knowledge-base hits as an appendix to the system prompt.
///
/// `budget_chars` bounds the combined hit text; each hit gets an equal share.
/// Returns an empty string when there are no hits.
pub fn build_knowledge_block(hits: &[KnowledgeHit], budget_chars: usize) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let per_hit = (budget_chars / hits.len()).max(1);
    let items = hits
        .iter()
        .map(|hit| {
            format!(
                "- [{}] score={:.2} :: {}",
                hit.kind,
                hit.score,
                truncate_for_prompt(hit.content.trim(), per_hit)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "\n\nCONOCIMIENTO MÉDICO RELEVANTE:\n{items}\n\
         [Usa estas referencias solo si son pertinentes a la consulta.]"
    )
}

// ─── image analysis ──────────────────────────────────────────────────────────

/// System and user prompt pair for an image analysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePrompts {
    pub system: String,
    pub user: String,
}

pub fn image_prompts(assistant_name: &str, user_type: UserType, clinical_context: &str) -> ImagePrompts {
    let context = if clinical_context.trim().is_empty() {
        "No proporcionado"
    } else {
        clinical_context.trim()
    };

    match user_type {
        UserType::Professional => ImagePrompts {
            system: format!(
                "Eres {assistant_name}, especialista en análisis de imágenes médicas para profesionales.\n\n\
                 PROPORCIONA:\n\
                 - Descripción técnica detallada de hallazgos\n\
                 - Interpretación usando terminología médica apropiada\n\
                 - Diagnósticos diferenciales imagenológicos\n\
                 - Correlación clínica recomendada\n\
                 - Estudios complementarios sugeridos\n\
                 - Limitaciones del análisis por IA\n\n\
                 Usa terminología médica precisa y detallada."
            ),
            user: format!(
                "Analiza esta imagen médica profesionalmente.\n\n\
                 CONTEXTO CLÍNICO: {context}\n\n\
                 Proporciona análisis técnico detallado incluyendo:\n\
                 1. Técnica y calidad de la imagen\n\
                 2. Hallazgos anatómicos normales\n\
                 3. Hallazgos patológicos específicos\n\
                 4. Diagnósticos diferenciales\n\
                 5. Correlación clínica necesaria\n\
                 6. Estudios adicionales recomendados\n\n\
                 Incluye disclaimers sobre limitaciones de IA."
            ),
        },
        UserType::Patient => ImagePrompts {
            system: format!(
                "Eres {assistant_name}, asistente que ayuda a pacientes a entender sus estudios médicos.\n\n\
                 PROPORCIONA:\n\
                 - Explicaciones claras y comprensibles\n\
                 - Evita crear ansiedad innecesaria\n\
                 - Enfatiza la importancia de la consulta médica\n\
                 - Usa lenguaje simple y empático\n\n\
                 Ayuda al paciente a entender su estudio."
            ),
            user: format!(
                "Explica esta imagen médica de manera comprensible para un paciente.\n\n\
                 CONTEXTO: {context}\n\n\
                 Incluye:\n\
                 1. Qué tipo de estudio es\n\
                 2. Qué se observa en general\n\
                 3. Importancia de discutir el resultado con el médico\n\
                 4. Qué preguntas hacer al médico\n\n\
                 Usa lenguaje simple y tranquilizador."
            ),
        },
    }
}

// ─── structured diagnosis ────────────────────────────────────────────────────

/// System prompt requesting a `DiagnosticResponse`-shaped JSON object.
pub fn build_diagnosis_prompt(assistant_name: &str, classification: &Classification) -> String {
    let user_type = classification.user_type.as_str();
    let urgency = classification.urgency.as_str();
    format!(
        "Eres {assistant_name}, sistema de IA médica. Genera un análisis médico estructurado.\n\n\
         INSTRUCCIONES:\n\
         - Analiza la consulta médica proporcionada\n\
         - Responde únicamente con un objeto JSON válido\n\
         - Adapta el nivel de detalle al tipo de usuario: {user_type}\n\
         - Considera el nivel de urgencia: {urgency}\n\n\
         FORMATO DE RESPUESTA JSON:\n\
         {{\n\
         \x20   \"analysis\": {{\n\
         \x20       \"chief_complaint\": \"Motivo de consulta principal\",\n\
         \x20       \"symptoms\": [\"síntoma1\", \"síntoma2\"],\n\
         \x20       \"duration\": \"duración de síntomas\",\n\
         \x20       \"severity\": \"leve/moderado/severo\",\n\
         \x20       \"patient_type\": \"{user_type}\",\n\
         \x20       \"urgency_level\": \"{urgency}\",\n\
         \x20       \"differential_diagnosis\": [\"diagnóstico1\", \"diagnóstico2\"],\n\
         \x20       \"recommended_actions\": [\"acción1\", \"acción2\"],\n\
         \x20       \"red_flags\": [\"bandera roja1\", \"bandera roja2\"]\n\
         \x20   }},\n\
         \x20   \"clinical_reasoning\": \"Razonamiento clínico detallado\",\n\
         \x20   \"treatment_plan\": [\"plan1\", \"plan2\"],\n\
         \x20   \"follow_up\": [\"seguimiento1\", \"seguimiento2\"],\n\
         \x20   \"education\": [\"educación1\", \"educación2\"],\n\
         \x20   \"warnings\": [\"advertencia1\", \"advertencia2\"]\n\
         }}"
    )
}

// ─── helpers ─────────────────────────────────────────────────────────────────

/// Cut `text` to at most `max_chars` characters.  A cut is marked with `…`,
/// which counts toward `max_chars`.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let truncated: String = text.chars().take(max_chars - 1).collect();
    format!("{truncated}…")
}

// ─── tests ───────────────────────────────────────────────────────────────────
