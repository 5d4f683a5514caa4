//! `list_templates`/`get_template`/`create_template_from_env` handlers
//! (§6). The latter is the Template Registry's other entry point besides
//! direct registration: it snapshots a *live* environment's current
//! catalog and row contents into a brand-new template (§4.D).

use super::error::Result;
use super::{AppState, AuthenticatedKey};
use crate::template::{TableDefinition, Template, Visibility};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub service: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListTemplatesResponse {
    pub templates: Vec<TemplateSummary>,
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(caller)): Extension<AuthenticatedKey>,
) -> Result<Json<ListTemplatesResponse>> {
    let templates = state.templates.list(Some(&caller)).await?;
    Ok(Json(ListTemplatesResponse {
        templates: templates
            .into_iter()
            .map(|t| TemplateSummary { id: t.id, service: t.service_name, name: t.template_name, description: t.description })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct TemplateDetailResponse {
    pub id: String,
    pub service: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
}

pub async fn get_template(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<TemplateDetailResponse>> {
    let template = state.templates.get(&id).await?;
    Ok(Json(TemplateDetailResponse {
        id: template.id,
        service: template.service_name,
        name: template.template_name,
        description: template.description,
        version: template.version,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateFromEnvRequest {
    pub environment_id: String,
    pub service: String,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TemplateCreatedResponse {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub service: String,
}

pub async fn create_template_from_env(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(caller)): Extension<AuthenticatedKey>,
    Json(body): Json<CreateTemplateFromEnvRequest>,
) -> Result<Json<TemplateCreatedResponse>> {
    let environment = state.isolation.get_environment(&body.environment_id).await?;
    let shapes = state.reflector.reflect(&environment.namespace_name).await?;
    let session = state.sessions.session_for(&environment.namespace_name).await?;

    let mut structural_definition = Vec::with_capacity(shapes.len());
    let mut seed_bundle = Vec::with_capacity(shapes.len());
    for shape in shapes.iter() {
        structural_definition.push(TableDefinition { name: shape.name.clone(), columns: shape.columns.clone() });
        let rows = session.scan_table(&shape.name).await?;
        seed_bundle.push((shape.name.clone(), rows));
    }
    session.close();

    let visibility = match &body.visibility {
        Some(v) => Visibility::parse(v)?,
        None => Visibility::Private,
    };

    let template = Template {
        id: String::new(),
        service_name: body.service,
        template_name: body.name,
        version: body.version.unwrap_or_else(|| "1".to_string()),
        description: body.description,
        structural_definition,
        seed_bundle,
        visibility,
        owner: Some(caller),
    };

    let registered = state.templates.register(template).await?;
    Ok(Json(TemplateCreatedResponse {
        id: registered.id,
        name: registered.template_name,
        description: registered.description,
        service: registered.service_name,
    }))
}
