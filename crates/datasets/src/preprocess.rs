use crate::{
    dataset::RawInput,
    error::{Error, Result},
};

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";

/// Smallest sequence length that leaves room for a pair's special tokens.
pub const MIN_SEQ_LEN: usize = 4;

/// Word-piece tokenizer seam used by the preprocessors.
pub trait TextTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    fn token_to_id(&self, token: &str) -> Option<u32>;
}

impl TextTokenizer for tokenizers::Tokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self.encode(text, false)?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        // The inherent lookup lives on the `TokenizerImpl` behind `Deref`.
        std::ops::Deref::deref(self).token_to_id(token)
    }
}

impl<T: TextTokenizer + ?Sized> TextTokenizer for &T {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        (**self).tokenize(text)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

/// Turns a raw input into a fixed-length sequence of token ids.
pub trait Preprocessor {
    fn encode(&self, input: &RawInput) -> Result<Vec<u32>>;

    fn max_len(&self) -> usize;

    fn pad_token_id(&self) -> u32;
}

/// BERT-style formatting: tokenise, pad to a fixed length, map tokens to ids.
#[derive(Debug, Clone)]
pub struct BertPreprocessor<T> {
    tokenizer: T,
    max_len: usize,
    pad_id: u32,
    unk_id: u32,
}

impl<T: TextTokenizer> BertPreprocessor<T> {
    pub fn new(tokenizer: T, max_len: usize) -> Result<Self> {
        if max_len < MIN_SEQ_LEN {
            return Err(Error::InvalidConfig(format!(
                "max sequence length must be at least {MIN_SEQ_LEN}, got {max_len}"
            )));
        }
        for token in [CLS_TOKEN, SEP_TOKEN] {
            if tokenizer.token_to_id(token).is_none() {
                return Err(Error::MissingSpecialToken(token));
            }
        }
        let pad_id = tokenizer
            .token_to_id(PAD_TOKEN)
            .ok_or(Error::MissingSpecialToken(PAD_TOKEN))?;
        let unk_id = tokenizer
            .token_to_id(UNK_TOKEN)
            .ok_or(Error::MissingSpecialToken(UNK_TOKEN))?;
        Ok(Self {
            tokenizer,
            max_len,
            pad_id,
            unk_id,
        })
    }

    fn to_ids(&self, tokens: &[&str]) -> Vec<u32> {
        tokens
            .iter()
            .map(|token| self.tokenizer.token_to_id(token).unwrap_or(self.unk_id))
            .collect()
    }
}

impl<T: TextTokenizer> Preprocessor for BertPreprocessor<T> {
    fn encode(&self, input: &RawInput) -> Result<Vec<u32>> {
        let padded = match input {
            RawInput::Single(text) => {
                let tokens = self.tokenizer.tokenize(text)?;
                self.to_ids(&pad_single(&tokens, self.max_len))
            }
            RawInput::Pair {
                premise,
                hypothesis,
            } => {
                let premise = self.tokenizer.tokenize(premise)?;
                let hypothesis = self.tokenizer.tokenize(hypothesis)?;
                self.to_ids(&pad_pair(&premise, &hypothesis, self.max_len))
            }
        };
        Ok(padded)
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }
}

/// `[CLS] tokens [PAD].. [SEP]`, truncating `tokens` to `max_len - 2`.
pub fn pad_single<S: AsRef<str>>(tokens: &[S], max_len: usize) -> Vec<&str> {
    let body = max_len.saturating_sub(2);
    let kept = &tokens[..tokens.len().min(body)];
    let mut out = Vec::with_capacity(max_len);
    out.push(CLS_TOKEN);
    out.extend(kept.iter().map(AsRef::as_ref));
    out.extend(std::iter::repeat(PAD_TOKEN).take(body - kept.len()));
    out.push(SEP_TOKEN);
    out
}

/// `[CLS] premise [SEP] hypothesis [PAD].. [SEP]`.
///
/// The premise keeps at most `max_len / 2 - 2` tokens and the hypothesis at
/// most `max_len / 2 - 1`, so the result is always exactly `max_len` long.
pub fn pad_pair<'a, S: AsRef<str>>(
    premise: &'a [S],
    hypothesis: &'a [S],
    max_len: usize,
) -> Vec<&'a str> {
    let half = max_len / 2;
    let premise = &premise[..premise.len().min(half.saturating_sub(2))];
    let hypothesis = &hypothesis[..hypothesis.len().min(half.saturating_sub(1))];
    let pads = max_len.saturating_sub(3 + premise.len() + hypothesis.len());

    let mut out = Vec::with_capacity(max_len);
    out.push(CLS_TOKEN);
    out.extend(premise.iter().map(AsRef::as_ref));
    out.push(SEP_TOKEN);
    out.extend(hypothesis.iter().map(AsRef::as_ref));
    out.extend(std::iter::repeat(PAD_TOKEN).take(pads));
    out.push(SEP_TOKEN);
    out
}
