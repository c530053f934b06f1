use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    is_unique_violation, page, parse_date, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, ts,
    Store, StoreError, StoreResult,
};
use crate::types::{Article, ContactRequest};
use crate::validation::validate_slug;

const ARTICLE_COLUMNS: &str = "id, slug, title, summary, body, cover_image_url, published, \
     published_at, author_id, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, name, phone, message, preferred_date, handled, handled_by, \
     created_at";

/// Partial article edit. An empty `cover_image_url` removes the cover.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArticleUpdate {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub body: Option<String>,
    pub cover_image_url: Option<String>,
    pub published: Option<bool>,
}

impl ArticleUpdate {
    pub fn apply(self, article: &mut Article) -> StoreResult<()> {
        if let Some(slug) = self.slug {
            validate_slug(&slug).map_err(|e| StoreError::Invalid(e.to_string()))?;
            article.slug = slug;
        }
        if let Some(v) = self.title {
            article.title = v;
        }
        if let Some(v) = self.summary {
            article.summary = v;
        }
        if let Some(v) = self.body {
            article.body = v;
        }
        if let Some(v) = self.cover_image_url {
            article.cover_image_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(published) = self.published {
            if published && article.published_at.is_none() {
                article.published_at = Some(Utc::now());
            }
            article.published = published;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    pub handled: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Store {
    // -----------------------------------------------------------------------
    // Articles
    // -----------------------------------------------------------------------

    /// Insert an article. A taken slug is a `Conflict`.
    pub async fn create_article(&self, article: &Article) -> StoreResult<()> {
        let article = article.clone();
        self.conn
            .call(move |conn| match write_article(conn, &article, true) {
                Ok(()) => Ok(Ok(())),
                Err(e) if is_unique_violation(&e) => Ok(Err(slug_taken(&article.slug))),
                Err(e) => Err(e.into()),
            })
            .await?
    }

    pub async fn get_article(&self, id: Uuid) -> StoreResult<Option<Article>> {
        self.find_article("id", id.to_string()).await
    }

    pub async fn get_article_by_slug(&self, slug: &str) -> StoreResult<Option<Article>> {
        self.find_article("slug", slug.to_string()).await
    }

    async fn find_article(
        &self,
        column: &'static str,
        value: String,
    ) -> StoreResult<Option<Article>> {
        let article = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE {column} = ?1");
                Ok(conn
                    .query_row(&sql, rusqlite::params![value], row_to_article)
                    .optional()?)
            })
            .await?;
        Ok(article)
    }

    /// Newest first by publication (drafts by creation) date.
    pub async fn list_articles(
        &self,
        published_only: bool,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StoreResult<Vec<Article>> {
        let (limit, offset) = page(limit, offset);
        let articles = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ARTICLE_COLUMNS} FROM articles
                     WHERE (?1 = 0 OR published = 1)
                     ORDER BY COALESCE(published_at, created_at) DESC
                     LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![published_only, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_article(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(articles)
    }

    pub async fn update_article(&self, id: Uuid, update: ArticleUpdate) -> StoreResult<Article> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1");
                let Some(mut article) = tx
                    .query_row(&sql, rusqlite::params![id], row_to_article)
                    .optional()?
                else {
                    return Ok(Err(StoreError::NotFound("article".into())));
                };
                if let Err(e) = update.apply(&mut article) {
                    return Ok(Err(e));
                }
                article.updated_at = Utc::now();
                match write_article(&tx, &article, false) {
                    Ok(()) => {}
                    Err(e) if is_unique_violation(&e) => {
                        return Ok(Err(slug_taken(&article.slug)))
                    }
                    Err(e) => return Err(e.into()),
                }
                tx.commit()?;
                Ok(Ok(article))
            })
            .await?
    }

    pub async fn delete_article(&self, id: Uuid) -> StoreResult<bool> {
        let id = id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM articles WHERE id = ?1", rusqlite::params![id])?)
            })
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Contact requests
    // -----------------------------------------------------------------------

    pub async fn create_contact_request(&self, request: &ContactRequest) -> StoreResult<()> {
        let r = request.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO contact_requests (id, name, phone, message, preferred_date,
                        handled, handled_by, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.name,
                        r.phone,
                        r.message,
                        r.preferred_date.map(|d| d.to_string()),
                        r.handled,
                        r.handled_by.map(|u| u.to_string()),
                        ts(&r.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_contact_requests(
        &self,
        filter: &ContactFilter,
    ) -> StoreResult<Vec<ContactRequest>> {
        let handled = filter.handled;
        let (limit, offset) = page(filter.limit, filter.offset);
        let requests = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {CONTACT_COLUMNS} FROM contact_requests
                     WHERE (?1 IS NULL OR handled = ?1)
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![handled, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_contact(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(requests)
    }

    /// Mark a request handled. Handling twice keeps the first handler.
    pub async fn mark_contact_handled(
        &self,
        id: Uuid,
        handled_by: Uuid,
    ) -> StoreResult<ContactRequest> {
        let id = id.to_string();
        let by = handled_by.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE contact_requests SET handled = 1, handled_by = ?2
                     WHERE id = ?1 AND handled = 0",
                    rusqlite::params![id, by],
                )?;
                let sql = format!("SELECT {CONTACT_COLUMNS} FROM contact_requests WHERE id = ?1");
                let request = conn
                    .query_row(&sql, rusqlite::params![id], row_to_contact)
                    .optional()?;
                Ok(request.ok_or_else(|| StoreError::NotFound("contact request".into())))
            })
            .await?
    }
}

fn slug_taken(slug: &str) -> StoreError {
    StoreError::Conflict(format!("slug '{slug}' is already in use"))
}

fn write_article(
    conn: &rusqlite::Connection,
    article: &Article,
    insert: bool,
) -> rusqlite::Result<()> {
    let sql = if insert {
        "INSERT INTO articles (id, slug, title, summary, body, cover_image_url, published,
            published_at, author_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    } else {
        "UPDATE articles SET slug=?2, title=?3, summary=?4, body=?5, cover_image_url=?6,
            published=?7, published_at=?8, author_id=?9, created_at=?10, updated_at=?11
         WHERE id = ?1"
    };
    conn.execute(
        sql,
        rusqlite::params![
            article.id.to_string(),
            article.slug,
            article.title,
            article.summary,
            article.body,
            article.cover_image_url,
            article.published,
            article.published_at.as_ref().map(ts),
            article.author_id.to_string(),
            ts(&article.created_at),
            ts(&article.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_article(row: &rusqlite::Row<'_>) -> rusqlite::Result<Article> {
    let id: String = row.get(0)?;
    let published_at: Option<String> = row.get(7)?;
    let author_id: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(Article {
        id: parse_uuid(0, &id)?,
        slug: row.get(1)?,
        title: row.get(2)?,
        summary: row.get(3)?,
        body: row.get(4)?,
        cover_image_url: row.get(5)?,
        published: row.get(6)?,
        published_at: parse_opt_ts(7, published_at)?,
        author_id: parse_uuid(8, &author_id)?,
        created_at: parse_ts(9, &created_at)?,
        updated_at: parse_ts(10, &updated_at)?,
    })
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRequest> {
    let id: String = row.get(0)?;
    let preferred_date: Option<String> = row.get(4)?;
    let handled_by: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(ContactRequest {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        message: row.get(3)?,
        preferred_date: preferred_date.map(|d| parse_date(4, &d)).transpose()?,
        handled: row.get(5)?,
        handled_by: parse_opt_uuid(6, handled_by)?,
        created_at: parse_ts(7, &created_at)?,
    })
}
