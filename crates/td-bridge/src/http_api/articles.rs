use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use td_core::store::ArticleUpdate;
use td_core::types::{Article, Privilege};
use td_core::validation::{slugify, validate_length, validate_slug};
use td_harness::security::InputSanitizer;

use super::state::ApiState;
use super::types::{ArticleListQuery, CreateArticleRequest};
use crate::api_error::ApiError;
use crate::auth::{Manager, MaybeUser};
use crate::side_effects::audit;

const MAX_BODY_CHARS: usize = 100_000;

fn body_sanitizer() -> InputSanitizer {
    InputSanitizer::new(MAX_BODY_CHARS)
}

fn is_staff(user: &MaybeUser) -> bool {
    user.0
        .as_ref()
        .is_some_and(|u| u.is_at_least(Privilege::Manager))
}

/// GET /api/articles -- published articles, newest first. Staff add
/// `?drafts=true` to include drafts.
pub(crate) async fn list_articles(
    State(state): State<Arc<ApiState>>,
    user: MaybeUser,
    Query(query): Query<ArticleListQuery>,
) -> Result<Json<Vec<Article>>, ApiError> {
    let published_only = !(query.drafts && is_staff(&user));
    Ok(Json(
        state
            .store
            .list_articles(published_only, query.limit, query.offset)
            .await?,
    ))
}

/// GET /api/articles/{slug}
pub(crate) async fn get_article(
    State(state): State<Arc<ApiState>>,
    user: MaybeUser,
    Path(slug): Path<String>,
) -> Result<Json<Article>, ApiError> {
    state
        .store
        .get_article_by_slug(&slug)
        .await?
        .filter(|a| a.published || is_staff(&user))
        .map(Json)
        .ok_or_else(|| ApiError::not_found("article"))
}

/// POST /api/articles
pub(crate) async fn create_article(
    State(state): State<Arc<ApiState>>,
    Manager(author): Manager,
    Json(req): Json<CreateArticleRequest>,
) -> Result<(StatusCode, Json<Article>), ApiError> {
    validate_length("title", &req.title, 1, 200)?;
    validate_length("summary", &req.summary, 0, 500)?;
    let body = body_sanitizer().sanitize(&req.body)?;

    let slug = match req.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(slug) => slug.to_string(),
        None => slugify(&req.title),
    };
    validate_slug(&slug)?;

    let now = Utc::now();
    let article = Article {
        id: Uuid::new_v4(),
        slug,
        title: req.title.trim().to_string(),
        summary: req.summary.trim().to_string(),
        body,
        cover_image_url: req.cover_image_url.filter(|u| !u.trim().is_empty()),
        published: req.published,
        published_at: req.published.then_some(now),
        author_id: author.id,
        created_at: now,
        updated_at: now,
    };
    state.store.create_article(&article).await?;
    info!(article_id = %article.id, slug = %article.slug, "article created");
    audit(
        &state.store,
        author.id,
        "article.create",
        "article",
        article.id,
        json!({ "slug": article.slug, "published": article.published }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(article)))
}

/// PUT /api/articles/{id}
pub(crate) async fn update_article(
    State(state): State<Arc<ApiState>>,
    Manager(editor): Manager,
    Path(id): Path<Uuid>,
    Json(mut update): Json<ArticleUpdate>,
) -> Result<Json<Article>, ApiError> {
    if let Some(title) = &update.title {
        validate_length("title", title, 1, 200)?;
    }
    if let Some(summary) = &update.summary {
        validate_length("summary", summary, 0, 500)?;
    }
    if let Some(body) = update.body.take() {
        update.body = Some(body_sanitizer().sanitize(&body)?);
    }
    let article = state.store.update_article(id, update).await?;
    audit(
        &state.store,
        editor.id,
        "article.update",
        "article",
        article.id,
        json!({ "slug": article.slug, "published": article.published }),
    )
    .await;
    Ok(Json(article))
}

/// DELETE /api/articles/{id}
pub(crate) async fn delete_article(
    State(state): State<Arc<ApiState>>,
    Manager(editor): Manager,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_article(id).await? {
        return Err(ApiError::not_found("article"));
    }
    audit(&state.store, editor.id, "article.delete", "article", id, json!({})).await;
    Ok(StatusCode::NO_CONTENT)
}
