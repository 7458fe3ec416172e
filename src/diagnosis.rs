//! Human-readable text for a predicted disease label.

#[derive(Debug, Clone, Copy)]
pub struct DiseaseInfo {
    pub description: &'static str,
    pub status: &'static str,
    pub recommendation: &'static str,
}

const HEALTHY_RECOMMENDATION: &str = "Continue current care practices. Monitor for any changes.";

const DISEASES: &[(&str, DiseaseInfo)] = &[
    (
        "rice_bacterial_blight",
        DiseaseInfo {
            description: "Bacterial blight causing white to grayish lesions on leaves",
            status: "diseased",
            recommendation: "Remove infected plants. Apply copper-based bactericides. Improve field drainage.",
        },
    ),
    (
        "rice_brown_spot",
        DiseaseInfo {
            description: "Fungal disease causing brown, oval lesions on leaves and grains",
            status: "diseased",
            recommendation: "Apply fungicides. Remove crop debris. Use resistant varieties.",
        },
    ),
    (
        "rice_leaf_smut",
        DiseaseInfo {
            description: "Fungal disease causing black spore masses on leaves",
            status: "diseased",
            recommendation: "Apply systemic fungicides. Remove infected plants. Rotate crops.",
        },
    ),
    (
        "wheat_brown_rust",
        DiseaseInfo {
            description: "Fungal rust disease causing reddish-brown pustules on leaves",
            status: "diseased",
            recommendation: "Apply fungicides. Use resistant varieties. Remove volunteer wheat.",
        },
    ),
    (
        "wheat_yellow_rust",
        DiseaseInfo {
            description: "Fungal rust disease causing yellow-orange pustules on leaves",
            status: "diseased",
            recommendation: "Apply fungicides early. Use resistant varieties. Monitor weather conditions.",
        },
    ),
    (
        "maize_common_rust",
        DiseaseInfo {
            description: "Fungal rust disease causing reddish-brown pustules on leaves",
            status: "diseased",
            recommendation: "Apply fungicides. Use resistant varieties. Monitor humidity levels.",
        },
    ),
    (
        "maize_northern_leaf_blight",
        DiseaseInfo {
            description: "Fungal disease causing long, elliptical gray lesions on leaves",
            status: "diseased",
            recommendation: "Apply fungicides. Use resistant varieties. Remove infected debris.",
        },
    ),
    (
        "potato_early_blight",
        DiseaseInfo {
            description: "Fungal disease causing dark brown lesions with concentric rings on leaves",
            status: "diseased",
            recommendation: "Apply fungicides. Remove infected leaves. Improve air circulation.",
        },
    ),
    (
        "potato_late_blight",
        DiseaseInfo {
            description: "Devastating fungal disease causing dark lesions and white mold on leaves",
            status: "diseased",
            recommendation: "Apply fungicides immediately. Remove infected plants. Monitor weather.",
        },
    ),
    (
        "tomato_bacterial_spot",
        DiseaseInfo {
            description: "Bacterial disease causing small, dark lesions with yellow halos on leaves",
            status: "diseased",
            recommendation: "Remove infected plants. Apply copper-based bactericides. Avoid overhead watering.",
        },
    ),
    (
        "tomato_early_blight",
        DiseaseInfo {
            description: "Fungal disease causing dark brown lesions with concentric rings on leaves",
            status: "diseased",
            recommendation: "Apply fungicides. Remove infected leaves. Improve air circulation.",
        },
    ),
    (
        "tomato_late_blight",
        DiseaseInfo {
            description: "Fungal disease causing dark, water-soaked lesions on leaves and fruit",
            status: "diseased",
            recommendation: "Apply fungicides immediately. Remove infected plants. Avoid wet foliage.",
        },
    ),
];

/// Exact match, then containment either way, then a generic entry. Any
/// `healthy_*` label gets the healthy entry.
pub fn disease_info(disease: &str) -> DiseaseInfo {
    let name = disease.trim().to_lowercase();

    if name.starts_with("healthy") {
        return DiseaseInfo {
            description: "Healthy plant with no visible disease symptoms",
            status: "healthy",
            recommendation: HEALTHY_RECOMMENDATION,
        };
    }

    let found = DISEASES
        .iter()
        .find(|(key, _)| *key == name)
        .or_else(|| {
            DISEASES
                .iter()
                .find(|(key, _)| !name.is_empty() && (key.contains(&name) || name.contains(key)))
        });

    match found {
        Some((_, info)) => *info,
        None => DiseaseInfo {
            description: "Unknown disease",
            status: "unknown",
            recommendation: "Consult with agricultural experts for proper diagnosis and treatment.",
        },
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// `tomato_early_blight` -> `Tomato Early Blight`,
/// `healthy_rice` -> `Healthy Rice Plant`.
pub fn format_disease_name(disease: &str) -> String {
    let disease = disease.trim();
    if disease.is_empty() {
        return "Unknown Disease".to_string();
    }

    if let Some(crop) = disease.strip_prefix("healthy_") {
        return format!("Healthy {} Plant", title_case(crop));
    }

    disease
        .split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Band for a confidence in [0, 1].
pub fn severity_level(confidence: f64) -> &'static str {
    match confidence {
        c if c >= 0.9 => "Very High",
        c if c >= 0.8 => "High",
        c if c >= 0.7 => "Medium-High",
        c if c >= 0.6 => "Medium",
        c if c >= 0.5 => "Medium-Low",
        c if c >= 0.3 => "Low",
        _ => "Very Low",
    }
}

pub fn summary(disease: &str, confidence: f64, crop_name: Option<&str>) -> String {
    let info = disease_info(disease);
    let mut text = format!(
        "**Diagnosis: {}**\n\n**Confidence:** {:.1}% ({} confidence)\n\n**Description:** {}\n\n**Status:** {}\n\n**Recommendation:** {}",
        format_disease_name(disease),
        confidence * 100.0,
        severity_level(confidence),
        info.description,
        title_case(info.status),
        info.recommendation,
    );
    if let Some(crop) = crop_name {
        text.push_str(&format!("\n\n**Crop:** {}", title_case(crop)));
    }
    text
}
