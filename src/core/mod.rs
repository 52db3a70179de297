pub mod dates;
pub mod facts;
pub mod mapping;
pub mod pipeline;
pub mod refine;
pub mod resolver;
pub mod rules;
pub mod selector;
pub mod template;
