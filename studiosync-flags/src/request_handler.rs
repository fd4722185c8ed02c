use crate::{
    api::{FlagCheckResponse, FlagError, FlagsResponse},
    flag_matching::FlagMatcher,
    flag_request::Subject,
    router,
};
use axum::{extract::State, http::HeaderMap};
use tracing::instrument;

pub struct RequestContext {
    pub state: State<router::State>,
    pub headers: HeaderMap,
}

/// Evaluates every active flag for the calling subject. Served from the
/// per-subject cache when warm, so results can trail admin writes by up to the
/// cache TTL.
#[instrument(skip_all, fields(subject_id = tracing::field::Empty))]
pub async fn process_flags_request(context: RequestContext) -> Result<FlagsResponse, FlagError> {
    let RequestContext { state, headers } = context;

    let subject = Subject::from_headers(&headers)?;
    tracing::Span::current().record("subject_id", subject.id.to_string().as_str());

    let evaluated = state.evaluation_cache.get_evaluated_flags(&subject).await?;

    Ok(FlagsResponse {
        flags: evaluated.as_ref().clone(),
    })
}

/// Evaluates a single flag. Always reads through to the store, the per-subject
/// cache is not consulted.
#[instrument(skip_all, fields(key = %key, subject_id = tracing::field::Empty))]
pub async fn process_check_request(
    context: RequestContext,
    key: &str,
) -> Result<FlagCheckResponse, FlagError> {
    let RequestContext { state, headers } = context;

    let subject = Subject::from_headers(&headers)?;
    tracing::Span::current().record("subject_id", subject.id.to_string().as_str());

    let enabled = FlagMatcher::new(subject, state.store.clone())
        .check(key)
        .await?;

    Ok(FlagCheckResponse {
        key: key.to_string(),
        enabled,
    })
}
