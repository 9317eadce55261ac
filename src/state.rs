//! Cache entries and the updates that can be applied to them.

/// One cache entry: the latest data, error and loading flags for a key.
///
/// After a fetch settles at most one of `data` and `error` is present.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct QueryState<D, E> {
    /// Value of the last successful fetch or manual write.
    pub data: Option<D>,
    /// Rejection of the last failed fetch or manual write.
    pub error: Option<E>,
    /// A fetch for this key is in flight.
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_loading: bool,
    /// This entry carries the very first fetch issued against its store.
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_loading_initial: bool,
}

impl<D, E> Default for QueryState<D, E> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_loading_initial: false,
        }
    }
}

impl<D, E> QueryState<D, E> {
    /// Entry holding `data` and nothing else.
    pub fn with_data(data: D) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Entry holding `error` and nothing else.
    pub fn with_error(error: E) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Returns true if the entry holds an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Store a successful value, clearing any previous error.
    pub fn resolve(&mut self, data: D) {
        self.data = Some(data);
        self.error = None;
    }

    /// Store a failure, clearing any previous value.
    pub fn reject(&mut self, error: E) {
        self.data = None;
        self.error = Some(error);
    }

    /// Apply a replacement or a field-level merge.
    pub fn apply(&mut self, update: EntryUpdate<D, E>) {
        match update {
            EntryUpdate::Replace(state) => *self = state,
            EntryUpdate::Merge(patch) => patch.apply_to(self),
        }
    }
}

/// Field-level update of a [`QueryState`]. Unset fields are left untouched.
///
/// # Example
///
/// ```ignore
/// // Optimistically show the new title without touching loading flags.
/// query.set_entry(EntryPatch::new().data(Some(todo)).error(None));
/// ```
#[derive(Debug, Clone)]
pub struct EntryPatch<D, E> {
    data: Option<Option<D>>,
    error: Option<Option<E>>,
    is_loading: Option<bool>,
    is_loading_initial: Option<bool>,
}

impl<D, E> Default for EntryPatch<D, E> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: None,
            is_loading_initial: None,
        }
    }
}

impl<D, E> EntryPatch<D, E> {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or clear, with `None`) the data field.
    pub fn data(mut self, data: Option<D>) -> Self {
        self.data = Some(data);
        self
    }

    /// Set (or clear, with `None`) the error field.
    pub fn error(mut self, error: Option<E>) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the loading flag.
    pub fn is_loading(mut self, is_loading: bool) -> Self {
        self.is_loading = Some(is_loading);
        self
    }

    /// Set the initial-loading flag.
    pub fn is_loading_initial(mut self, is_loading_initial: bool) -> Self {
        self.is_loading_initial = Some(is_loading_initial);
        self
    }

    fn apply_to(self, state: &mut QueryState<D, E>) {
        if let Some(data) = self.data {
            state.data = data;
        }
        if let Some(error) = self.error {
            state.error = error;
        }
        if let Some(is_loading) = self.is_loading {
            state.is_loading = is_loading;
        }
        if let Some(is_loading_initial) = self.is_loading_initial {
            state.is_loading_initial = is_loading_initial;
        }
    }
}

/// Manual write to one entry: wholesale replacement or field merge.
#[derive(Debug, Clone)]
pub enum EntryUpdate<D, E> {
    /// Replace the whole entry.
    Replace(QueryState<D, E>),
    /// Merge the set fields into the existing (or a fresh) entry.
    Merge(EntryPatch<D, E>),
}

impl<D, E> From<EntryPatch<D, E>> for EntryUpdate<D, E> {
    fn from(patch: EntryPatch<D, E>) -> Self {
        EntryUpdate::Merge(patch)
    }
}

impl<D, E> From<QueryState<D, E>> for EntryUpdate<D, E> {
    fn from(state: QueryState<D, E>) -> Self {
        EntryUpdate::Replace(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type State = QueryState<String, String>;

    #[test]
    fn test_resolve_and_reject_are_exclusive() {
        let mut state = State::with_error("old".into());
        state.resolve("new".into());
        assert_eq!(state.data.as_deref(), Some("new"));
        assert!(!state.is_error());

        state.reject("bad".into());
        assert_eq!(state.data, None);
        assert_eq!(state.error.as_deref(), Some("bad"));
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut state = State {
            data: Some("a".into()),
            error: None,
            is_loading: true,
            is_loading_initial: false,
        };
        state.apply(EntryPatch::new().data(Some("b".into())).into());

        assert_eq!(state.data.as_deref(), Some("b"));
        assert!(state.is_loading);
    }

    #[test]
    fn test_merge_can_clear_field() {
        let mut state = State::with_data("a".into());
        state.apply(EntryPatch::new().data(None).is_loading(true).into());

        assert_eq!(state.data, None);
        assert!(state.is_loading);
    }

    #[test]
    fn test_replace_overwrites_everything() {
        let mut state = State {
            data: Some("a".into()),
            error: None,
            is_loading: true,
            is_loading_initial: true,
        };
        state.apply(State::with_error("e".into()).into());

        assert_eq!(state, State::with_error("e".into()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_wire_field_names() {
        let state: QueryState<u32, String> = QueryState::with_data(7);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "data": 7,
                "error": null,
                "isLoading": false,
                "isLoadingInitial": false,
            })
        );

        let parsed: QueryState<u32, String> = serde_json::from_str(r#"{"data":1}"#).unwrap();
        assert_eq!(parsed, QueryState::with_data(1));
    }
}
