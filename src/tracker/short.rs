use core::fmt;

/// Number of trailing characters kept when shortening an identifier.
const SHORT_LEN: usize = 5;

pub struct ShortId<'a>(&'a str);

impl<'a> ShortId<'a> {
    fn new<T>(data: &'a T) -> ShortId<'a>
    where
        T: ?Sized + AsRef<str> + 'a,
    {
        ShortId(data.as_ref())
    }
}

impl fmt::Display for ShortId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(SHORT_LEN - 1)
            .map_or(0, |(i, _)| i);
        write!(f, "{}", &self.0[start..])
    }
}

impl fmt::Debug for ShortId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Device and connector ids are long opaque strings. Their tails are unique
/// enough to tell them apart in log lines.
pub trait ShortIdExt {
    fn short(&self) -> ShortId<'_>;
}

impl<T> ShortIdExt for T
where
    T: ?Sized + AsRef<str>,
{
    fn short(&self) -> ShortId<'_> {
        ShortId::new(self)
    }
}
