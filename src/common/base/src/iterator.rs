use futures::stream::{self, BoxStream, StreamExt};

/// AsyncIterator is a pull based, fallible, lazy sequence. `Ok(None)` marks the end of
/// the sequence as it is known *right now*; iterators over a growing source may yield
/// more items when polled again later.
#[async_trait]
pub trait AsyncIterator {
    type Item;
    type Error;

    async fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error>;
}

#[async_trait]
pub trait AsyncIteratorExt: AsyncIterator + Send {
    /// try_collect drains the iterator into a Vec, stopping at the first error.
    async fn try_collect(&mut self) -> Result<Vec<Self::Item>, Self::Error>
    where
        Self::Item: Send,
    {
        let mut items = Vec::new();
        while let Some(item) = self.try_next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// into_stream adapts the iterator into a `futures::Stream`. The stream ends after the
    /// iterator returns `Ok(None)`, or right after yielding the first error.
    fn into_stream(self) -> BoxStream<'static, Result<Self::Item, Self::Error>>
    where
        Self: Sized + 'static,
        Self::Item: Send + 'static,
        Self::Error: Send + 'static,
    {
        let s = stream::unfold(Some(self), |itr| async move {
            let mut itr = itr?;
            match itr.try_next().await {
                Ok(Some(item)) => Some((Ok(item), Some(itr))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });
        s.boxed()
    }
}

impl<I: AsyncIterator + Send + ?Sized> AsyncIteratorExt for I {}

/// AsyncIterators chains several iterators, draining them in order.
pub struct AsyncIterators<ITEM, ERR, ITR>
where
    ITR: AsyncIterator<Item = ITEM, Error = ERR> + Send,
{
    itrs: Vec<ITR>,
    i: usize,
}

impl<ITEM, ERR, ITR> AsyncIterators<ITEM, ERR, ITR>
where
    ITR: AsyncIterator<Item = ITEM, Error = ERR> + Send,
{
    pub fn new(itrs: Vec<ITR>) -> Self {
        Self { itrs, i: 0 }
    }
}

#[async_trait]
impl<ITEM, ERR, ITR> AsyncIterator for AsyncIterators<ITEM, ERR, ITR>
where
    ITEM: Send,
    ERR: Send,
    ITR: AsyncIterator<Item = ITEM, Error = ERR> + Send,
{
    type Item = ITEM;
    type Error = ERR;

    async fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        while self.i < self.itrs.len() {
            let itr = &mut self.itrs[self.i];
            if let Some(v) = itr.try_next().await? {
                return Ok(Some(v));
            }

            self.i += 1;
        }

        Ok(None)
    }
}
