use crate::Promise;

/// Extend `Future` with conversion into a [`Promise`].
///
/// The future is driven on the crate's shared thread pool, so it must be
/// runtime agnostic.
///
/// # Example
/// ```
/// # use orderly::promise_ext::IntoPromise;
/// #
/// # async {
/// let promise = async { Ok::<_, String>(42) }.into_promise();
/// assert_eq!(promise.await, Ok(42));
/// # };
/// ```
pub trait IntoPromise<T, E>: Future<Output = Result<T, E>> {
    fn into_promise(self) -> Promise<T, E>
    where
        Self: Sized + Send + 'static,
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        Promise::from_future(self)
    }
}

impl<F, T, E> IntoPromise<T, E> for F where F: Future<Output = Result<T, E>> {}
