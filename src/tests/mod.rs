mod completion;
mod support;
