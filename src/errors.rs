use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) expected: (u32, u32),
    pub(crate) got: (u32, u32),
    pub(crate) name: &'static str,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} image size ({}x{}) must match the content image size ({}x{})",
            self.name, self.got.0, self.got.1, self.expected.0, self.expected.1
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The content, style and candidate images must all have the same
    /// spatial dimensions
    ShapeMismatch(ShapeMismatch),
    /// A tensor handed to the feature pipeline had a malformed shape
    Shape(String),
    /// A configured layer id is absent from the backbone's layer table
    UnknownLayer(String),
    /// The loss became NaN or infinite during optimization. The run halts
    /// rather than returning a corrupted candidate image.
    NonFiniteLoss { iteration: usize },
    /// A session needs both a content and a style image
    MissingImage(&'static str),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::Shape(s) => write!(f, "malformed tensor shape: {}", s),
            Self::UnknownLayer(id) => {
                write!(f, "the layer '{}' is not present in the backbone", id)
            }
            Self::NonFiniteLoss { iteration } => {
                write!(f, "the loss became non-finite at iteration {}", iteration)
            }
            Self::MissingImage(which) => {
                write!(f, "a {} image must be provided before building", which)
            }
            Self::Io(io) => write!(f, "{}", io),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}
