use crate::store::Post;

/// Result of a timeline search.
///
/// `NoQuery` means nothing was asked yet (show a prompt), while an empty
/// `Matches` means the query ran and nothing matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResults<'a> {
    NoQuery,
    Matches(Vec<&'a Post>),
}

impl<'a> SearchResults<'a> {
    pub fn is_no_query(&self) -> bool {
        matches!(self, SearchResults::NoQuery)
    }

    pub fn has_no_matches(&self) -> bool {
        matches!(self, SearchResults::Matches(found) if found.is_empty())
    }

    pub fn posts(&self) -> &[&'a Post] {
        match self {
            SearchResults::NoQuery => &[],
            SearchResults::Matches(found) => found,
        }
    }

    pub fn len(&self) -> usize {
        self.posts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts().is_empty()
    }
}

/// Case-sensitive substring search that keeps timeline order.
pub fn search<'a>(posts: &'a [Post], query: &str) -> SearchResults<'a> {
    if query.is_empty() {
        return SearchResults::NoQuery;
    }
    SearchResults::Matches(
        posts
            .iter()
            .filter(|post| post.content.contains(query))
            .collect(),
    )
}
