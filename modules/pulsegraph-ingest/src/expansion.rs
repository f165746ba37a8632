use std::collections::HashSet;

use pulsegraph_common::{PostEvent, PostRecord};

/// Flatten one stream arrival into the records to process, in order.
///
/// Referenced originals the source included come first so they are stored
/// under their own identity and author. The wrapping post follows, except a
/// repost whose original was included: its only content is the original, so
/// processing it again would collapse onto the same id.
pub fn expand_event(event: PostEvent) -> Vec<PostRecord> {
    let PostEvent { post, included } = event;
    if post.references.is_empty() {
        return vec![post];
    }

    let referenced: HashSet<&str> = post.references.iter().map(|r| r.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut records: Vec<PostRecord> = included
        .into_iter()
        .filter(|p| referenced.contains(p.id.as_str()) && seen.insert(p.id.clone()))
        .collect();

    let original_included = post
        .repost_target()
        .is_some_and(|target| seen.contains(target));
    if !original_included {
        records.push(post);
    }
    records
}
