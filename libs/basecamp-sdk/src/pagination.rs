//! Link-header pagination.
//!
//! Follows `Link: <url>; rel="next"` from page to page. Every next link is
//! resolved against the page that carried it and must stay on the origin
//! of the first page; a link to any other origin is rejected before it is
//! fetched, so credentials never leave the API host.

use crate::client::Client;
use crate::error::Error;
use crate::response::HttpResponse;
use http::Method;
use http::header::LINK;
use serde::de::DeserializeOwned;
use std::ops::{Deref, Index};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Metadata about a collected list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListMeta {
    /// `X-Total-Count` of the first page; 0 when absent or invalid.
    pub total_count: u64,
    /// More items existed than were returned (item cap or page ceiling).
    pub truncated: bool,
}

/// Items gathered across pages, plus [`ListMeta`].
///
/// Derefs to `[T]`, so it indexes and iterates like a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    pub meta: ListMeta,
}

impl<T> ListResult<T> {
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for ListResult<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> Index<usize> for ListResult<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<T> IntoIterator for ListResult<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ListResult<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Target of the `rel="next"` entry of a `Link` header value.
#[must_use]
pub fn parse_next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|part| {
        let part = part.trim();
        let (target, params) = part.strip_prefix('<')?.split_once('>')?;
        params
            .split(';')
            .filter_map(|p| p.trim().split_once('='))
            .any(|(k, v)| {
                k.trim().eq_ignore_ascii_case("rel")
                    && v.trim().trim_matches('"').split_whitespace().any(|r| r.eq_ignore_ascii_case("next"))
            })
            .then_some(target.trim())
    })
}

/// Scheme, host and port (default ports filled in) are equal.
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme().eq_ignore_ascii_case(b.scheme())
        && a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Resolved, origin-checked next page URL of `page`, if any.
fn next_page_url(page: &HttpResponse, origin: &Url) -> Result<Option<Url>, Error> {
    let Some(link) = page
        .headers()
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_next_link)
    else {
        return Ok(None);
    };

    let next = page.url().join(link).map_err(|e| {
        Error::usage(format!("Invalid pagination link: {link}")).with_source(e)
    })?;
    if !same_origin(origin, &next) {
        return Err(Error::usage(format!(
            "Pagination link points to a different origin: {}",
            next.origin().ascii_serialization()
        ))
        .with_hint(format!("Expected {}", origin.origin().ascii_serialization())));
    }
    Ok(Some(next))
}

impl Client {
    /// GET `path` and every following page, collecting up to `max_items`
    /// items (`None` for all).
    ///
    /// The first page goes through the full pipeline (cache, retry); follow-up
    /// pages use the authenticated raw stack.
    ///
    /// # Errors
    ///
    /// Returns the structured error of the first failing page, a `Usage`
    /// error for a cross-origin next link, or an `ApiError` when a page is
    /// not a JSON array of `T`.
    pub async fn fetch_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        max_items: Option<usize>,
    ) -> Result<ListResult<T>, Error> {
        let first = self.request(Method::GET, path).send().await?;
        self.collect_pages(first, max_items, None).await
    }

    /// Like [`fetch_all_pages`](Self::fetch_all_pages), starting from a
    /// first-page response the caller already holds.
    ///
    /// # Errors
    ///
    /// Same as [`fetch_all_pages`](Self::fetch_all_pages).
    pub async fn request_paginated<T: DeserializeOwned>(
        &self,
        first: HttpResponse,
        max_items: Option<usize>,
    ) -> Result<ListResult<T>, Error> {
        self.collect_pages(first, max_items, None).await
    }

    /// [`fetch_all_pages`](Self::fetch_all_pages) that stops between pages
    /// once `token` is cancelled.
    ///
    /// # Errors
    ///
    /// As [`fetch_all_pages`](Self::fetch_all_pages), plus `Cancelled`.
    pub async fn fetch_all_pages_with_cancellation<T: DeserializeOwned>(
        &self,
        path: &str,
        max_items: Option<usize>,
        token: CancellationToken,
    ) -> Result<ListResult<T>, Error> {
        let first = self
            .request(Method::GET, path)
            .cancellation(token.clone())
            .send()
            .await?;
        self.collect_pages(first, max_items, Some(token)).await
    }

    async fn collect_pages<T: DeserializeOwned>(
        &self,
        first: HttpResponse,
        max_items: Option<usize>,
        cancel: Option<CancellationToken>,
    ) -> Result<ListResult<T>, Error> {
        let origin = first.url().clone();
        let total_count = first.total_count();
        let max_pages = self.config.max_pages;

        let mut next = next_page_url(&first, &origin)?;
        let mut items: Vec<T> = first.json().await?;
        let mut pages = 1;
        let mut truncated = false;

        loop {
            if let Some(max) = max_items
                && items.len() >= max
            {
                truncated = items.len() > max || next.is_some();
                items.truncate(max);
                break;
            }
            let Some(url) = next.take() else {
                break;
            };
            if pages >= max_pages {
                tracing::warn!(max_pages, items = items.len(), "pagination capped at page limit");
                truncated = true;
                break;
            }
            if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::cancelled());
            }

            let mut request = self.raw_request(Method::GET, url);
            if let Some(token) = &cancel {
                request = request.cancellation(token.clone());
            }
            let page = request.send().await?;
            next = next_page_url(&page, &origin)?;
            let page_items: Vec<T> = page.json().await?;
            items.extend(page_items);
            pages += 1;
        }

        tracing::debug!(pages, items = items.len(), truncated, "pagination finished");
        Ok(ListResult {
            items,
            meta: ListMeta {
                total_count,
                truncated,
            },
        })
    }
}
