// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Follow-up message rendering.
//!
//! Each stage selects from a small pool of templates keyed by the snapshot's
//! profile type, engagement level, and whether objections were raised.
//! Variables substitute from the snapshot; unset variables render as empty
//! strings so no placeholder ever reaches a user.

use cauce_core::{ContextSnapshot, EngagementLevel, ProfileType};

/// Render the message for a stage from its activation snapshot.
pub fn render(stage: u8, snapshot: &ContextSnapshot) -> String {
    let pool = pool_for(stage, snapshot);
    let variant = variant_index(stage, snapshot, pool.len());
    let template = pool[variant];

    let rendered = template
        .replace("{time_reference}", time_reference(stage))
        .replace("{specific_products}", &specific_products(snapshot))
        .replace("{budget_reference}", &budget_reference(snapshot))
        .replace("{questions_reference}", &questions_reference(snapshot))
        .replace("{objection_response}", objection_response(snapshot))
        .replace("{personalized_cta}", personalized_cta(snapshot));

    tidy(&rendered)
}

/// Deterministic variant selection; no randomness so a retried job renders
/// the same text.
fn variant_index(stage: u8, snapshot: &ContextSnapshot, pool_len: usize) -> usize {
    let engagement = match snapshot.profile.engagement_level {
        EngagementLevel::Low => 0,
        EngagementLevel::Medium => 1,
        EngagementLevel::High => 2,
    };
    let objections = usize::from(!snapshot.profile.objections_raised.is_empty());
    (stage as usize + engagement + objections) % pool_len.max(1)
}

fn pool_for(stage: u8, snapshot: &ContextSnapshot) -> &'static [&'static str] {
    let entrepreneur = matches!(
        snapshot.profile.profile_type,
        Some(ProfileType::Entrepreneur) | Some(ProfileType::Reseller)
    );
    match stage {
        0 => {
            if entrepreneur {
                STAGE0_ENTREPRENEUR
            } else {
                STAGE0_GENERAL
            }
        }
        1..=2 => EARLY,
        3..=5 => {
            if snapshot.recent_products.is_empty() {
                MID_GENERAL
            } else {
                MID_PRODUCTS
            }
        }
        6..=9 => OFFERS,
        10..=12 => CLOSING,
        _ => MAINTENANCE,
    }
}

const STAGE0_GENERAL: &[&str] = &[
    "¡Hola! {time_reference} estuvimos charlando y quedé pendiente de vos. \
     {questions_reference}¿Seguís con ganas de verlo?",
    "¿Cómo va? {time_reference} me consultaste y no quiero dejarte sin respuesta. \
     {questions_reference}Avisame y lo retomamos.",
];

const STAGE0_ENTREPRENEUR: &[&str] = &[
    "¡Hola! {time_reference} hablamos de tu emprendimiento y me quedé con ganas de \
     ayudarte a arrancar. {questions_reference}{budget_reference}¿Lo retomamos?",
    "¿Cómo va todo? {time_reference} charlamos sobre tu negocio. {questions_reference}\
     Si querés, te armo una propuesta concreta.",
];

const EARLY: &[&str] = &[
    "¿Pudiste pensarlo? Cualquier duda que tengas estoy acá para ayudarte. \
     {questions_reference}{objection_response}",
    "Paso a saludarte y a recordarte que sigo a disposición. {questions_reference}\
     {personalized_cta}",
];

const MID_PRODUCTS: &[&str] = &[
    "Te escribo porque {time_reference} estuviste viendo {specific_products} y siguen \
     disponibles. {budget_reference}{objection_response}{personalized_cta}",
    "¿Te acordás de {specific_products}? Se están moviendo rápido y no quiero que te \
     quedes sin stock. {personalized_cta}",
];

const MID_GENERAL: &[&str] = &[
    "Estuve pensando en lo que charlamos {time_reference}. {questions_reference}\
     Tengo novedades que te pueden servir. {personalized_cta}",
    "¿Seguís buscando? Entraron cosas nuevas que van con lo que me contaste. \
     {personalized_cta}",
];

const OFFERS: &[&str] = &[
    "Tengo una promo por estos días que aplica justo a lo que mirabas\
     {budget_reference}. Si te interesa avisame hoy y te la reservo. {objection_response}",
    "Última semana de beneficios en {specific_products}. {personalized_cta}",
    "Hay descuento vigente para arrancar con poco{budget_reference}. \
     ¿Te paso el detalle? {objection_response}",
];

const CLOSING: &[&str] = &[
    "No quiero ser pesada, así que este es de los últimos mensajes que te mando. \
     Si más adelante retomás la idea, escribime cuando quieras.",
    "Te dejo de molestar por ahora. Cualquier cosa que necesites, ya sabés dónde \
     encontrarme. ¡Que andes bien!",
];

const MAINTENANCE: &[&str] = &[
    "¡Tanto tiempo! Entraron novedades en {specific_products} y me acordé de vos. \
     Si querés te paso el catálogo actualizado.",
    "Paso a contarte que renovamos el catálogo. {time_reference} hablamos sobre tu \
     compra y capaz ahora es buen momento. {personalized_cta}",
];

fn time_reference(stage: u8) -> &'static str {
    match stage {
        0 => "hace un rato",
        1 => "ayer",
        2 => "hace un par de días",
        3 => "hace unos días",
        4 => "hace una semana",
        5 => "hace diez días",
        6 => "hace dos semanas",
        7 => "hace unas semanas",
        8 => "hace casi un mes",
        9 => "hace un mes",
        10..=12 => "hace un buen tiempo",
        _ => "hace bastante",
    }
}

fn specific_products(snapshot: &ContextSnapshot) -> String {
    let names: Vec<&str> = snapshot
        .recent_products
        .iter()
        .rev()
        .take(2)
        .map(|p| p.name.as_str())
        .collect();
    match names.as_slice() {
        [] => "los productos que vimos".to_string(),
        [one] => (*one).to_string(),
        [first, second] => format!("{second} y {first}"),
        more => more.join(" y "),
    }
}

fn budget_reference(snapshot: &ContextSnapshot) -> String {
    match &snapshot.profile.budget_mentioned {
        Some(budget) if !budget.is_empty() => format!(" con {budget}"),
        _ => String::new(),
    }
}

fn questions_reference(snapshot: &ContextSnapshot) -> String {
    match snapshot.last_questions.last() {
        Some(question) if !question.is_empty() => {
            format!("Me habías preguntado por {question}. ")
        }
        _ => String::new(),
    }
}

fn objection_response(snapshot: &ContextSnapshot) -> &'static str {
    if snapshot.profile.objections_raised.is_empty() {
        ""
    } else {
        " Y sobre lo que te hacía dudar: lo vemos juntos, sin compromiso."
    }
}

fn personalized_cta(snapshot: &ContextSnapshot) -> &'static str {
    match snapshot.profile.profile_type {
        Some(ProfileType::Entrepreneur) => "¿Te armo un combo para tu emprendimiento?",
        Some(ProfileType::Reseller) => "¿Querés ver la lista mayorista actualizada?",
        _ => "¿Te paso fotos y precios?",
    }
}

/// Collapse the gaps empty variables leave behind.
fn tidy(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c == ' ' {
            if last_space {
                continue;
            }
            last_space = true;
        } else {
            last_space = false;
        }
        out.push(c);
    }
    out.replace(" .", ".").replace(" ,", ",").trim().to_string()
}
