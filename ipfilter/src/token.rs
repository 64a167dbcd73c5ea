/// Whitespace-delimited segments of one rule line.
///
/// Anything after `#` is a comment. Quoting and escaping are not supported.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    items: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    pub fn scan(line: &'a str) -> Self {
        let line = match line.find('#') {
            Some(i) => &line[..i],
            None => line,
        };
        Self {
            items: line.split_whitespace().collect(),
            pos: 0,
        }
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.items.get(self.pos).copied()
    }

    pub fn peek_nth(&self, n: usize) -> Option<&'a str> {
        self.items.get(self.pos + n).copied()
    }

    /// Consumes the next segment if it equals `word`.
    pub fn next_if(&mut self, word: &str) -> bool {
        if self.peek() == Some(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.items.len()
    }

    /// Index of the next segment in the line.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.peek()?;
        self.pos += 1;
        Some(item)
    }
}
