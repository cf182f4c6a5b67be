mod degradation;
mod fixes;
mod lsp_backed;
mod query;
mod realtime;
mod scenarios;
